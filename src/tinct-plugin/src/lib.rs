//! External plugin support for the Tinct colour palette tool.
//!
//! This crate provides:
//! - Protocol detection: which wire convention a plugin binary speaks
//! - Two transports: a persistent RPC connection and single-shot JSON over stdio
//! - [`PluginExecutor`], one interface over both, with uniform timeouts,
//!   cancellation and errors
//! - The plugin side of the RPC transport, for plugins written in Rust
//!
//! # Plugin CLI contract
//!
//! Every plugin answers `--plugin-info` with JSON metadata:
//!
//! ```text
//! $ my-plugin --plugin-info
//! {"name":"random","type":"input","version":"1.0.0",
//!  "protocol_version":"0.0.1","plugin_protocol":"json-stdio"}
//! ```
//!
//! `plugin_protocol` selects the transport (`"json-stdio"` or empty for
//! JSON-stdio, `"go-plugin"` for RPC).
//!
//! # Example JSON-stdio input plugin (pseudocode)
//!
//! ```text
//! if args == ["--plugin-info"]:
//!     print(json({"name": "random", "type": "input", "protocol_version": "0.0.1"}))
//!     exit(0)
//! options = json_parse(read_all_stdin())
//! print(json({"colors": [{"r": 26, "g": 27, "b": 38}], "wallpaper_path": ""}))
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use tinct_plugin::{CallContext, InputOptions, PluginExecutor};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), tinct_plugin::PluginError> {
//! let mut executor = PluginExecutor::new("/usr/lib/tinct/plugins/random").await?;
//! let ctx = CallContext::with_timeout(Duration::from_secs(30));
//! let colours = executor.execute_input(&ctx, &InputOptions::default()).await?;
//! println!("{} colours", colours.len());
//! executor.close().await;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod detect;
pub mod error;
pub mod executor;
pub mod handshake;
pub mod json_stdio;
pub mod process;
pub mod protocol;
pub mod rpc;
pub mod testing;
pub mod version;

pub use context::{CallContext, ContextError};
pub use detect::{classify, detect, detect_with, query_plugin_info, DetectedPlugin};
pub use error::PluginError;
pub use executor::{PluginExecutor, PluginExecutorBuilder};
pub use json_stdio::{InputReply, JsonStdioTransport};
pub use process::{ProcessOutput, ProcessRunner, RealProcessRunner};
pub use protocol::{
    CategorisedColour, FlagHelp, GeneratedFiles, InputOptions, PaletteData, PluginArgs,
    PluginInfo, PluginKind, PreExecuteOutcome, RgbColour, Transport, WrittenFiles,
};
pub use version::{
    check_compatibility, current_version, is_compatible, Version, VersionError,
    MIN_COMPATIBLE_VERSION, PROTOCOL_VERSION,
};
