//! Identity exchange that opens an RPC plugin connection.
//!
//! The host launches the plugin with the magic cookie in its environment.
//! The plugin answers with one line on stdout:
//!
//! ```text
//! CORE_PROTOCOL_VERSION|APP_PROTOCOL_VERSION|NETWORK|CODEC
//! ```
//!
//! e.g. `1|0|stdio|json`. Anything else means the two sides cannot talk.

use std::fmt;

use crate::version::current_version;

/// Environment variable that marks a process as launched by a Tinct host.
pub const MAGIC_COOKIE_KEY: &str = "TINCT_PLUGIN";
pub const MAGIC_COOKIE_VALUE: &str = "tinct_color_palette";

/// Version of the connection framing itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

pub const NETWORK: &str = "stdio";
pub const CODEC: &str = "json";

/// The application protocol number exchanged in the handshake: the major
/// component of the plugin protocol version.
pub fn app_protocol_version() -> u64 {
    current_version().major
}

/// True when this process was started by a host that set the magic cookie.
pub fn cookie_present() -> bool {
    std::env::var(MAGIC_COOKIE_KEY).as_deref() == Ok(MAGIC_COOKIE_VALUE)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    pub core_version: u32,
    pub app_version: u64,
    pub network: String,
    pub codec: String,
}

impl HandshakeLine {
    /// The line this build of the protocol writes and expects.
    pub fn current() -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version: app_protocol_version(),
            network: NETWORK.to_string(),
            codec: CODEC.to_string(),
        }
    }

    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim_end_matches(['\r', '\n']);
        let parts: Vec<&str> = line.split('|').collect();
        let [core, app, network, codec] = parts.as_slice() else {
            return Err(format!(
                "unrecognised handshake line {line:?}, expected 4 '|'-separated fields"
            ));
        };
        let core_version = core
            .parse()
            .map_err(|_| format!("invalid core protocol version {core:?}"))?;
        let app_version = app
            .parse()
            .map_err(|_| format!("invalid app protocol version {app:?}"))?;
        Ok(Self {
            core_version,
            app_version,
            network: network.to_string(),
            codec: codec.to_string(),
        })
    }

    /// Checks every field against [`HandshakeLine::current`].
    pub fn validate(&self) -> Result<(), String> {
        let expected = Self::current();
        if self.core_version != expected.core_version {
            return Err(format!(
                "core protocol version {} is not supported, expected {}",
                self.core_version, expected.core_version
            ));
        }
        if self.app_version != expected.app_version {
            return Err(format!(
                "plugin speaks app protocol {}, host speaks {}",
                self.app_version, expected.app_version
            ));
        }
        if self.network != expected.network {
            return Err(format!("unsupported network {:?}", self.network));
        }
        if self.codec != expected.codec {
            return Err(format!("unsupported codec {:?}", self.codec));
        }
        Ok(())
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.core_version, self.app_version, self.network, self.codec
        )
    }
}
