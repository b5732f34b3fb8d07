//! Errors raised while detecting, spawning, or calling plugins.
//!
//! Every variant that concerns a specific plugin carries its executable path
//! so the caller can attribute the failure. I/O errors are wrapped in `Arc`
//! so they can be shared across tasks.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::context::ContextError;
use crate::version::VersionError;

/// Errors arising from plugin operations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The `--plugin-info` query failed or produced unusable metadata.
    #[error("failed to detect protocol of plugin {path}: {message}")]
    Detection { path: PathBuf, message: String },

    /// The plugin declared a transport this host does not speak.
    #[error("plugin {path} declares unknown plugin_protocol {declared:?}")]
    UnsupportedTransport { path: PathBuf, declared: String },

    /// The RPC handshake was refused or malformed.
    #[error("handshake with plugin {path} failed: {message}")]
    Handshake { path: PathBuf, message: String },

    /// The plugin's declared protocol version cannot be driven by this host.
    #[error("plugin {path} is incompatible: {source}")]
    VersionIncompatible {
        path: PathBuf,
        #[source]
        source: VersionError,
    },

    /// A version string was malformed.
    #[error(transparent)]
    Version(#[from] VersionError),

    /// The plugin process could not be started.
    #[error("failed to spawn plugin {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The caller's deadline (or an internal hook timeout) passed first.
    #[error("plugin {path} {operation}: context deadline exceeded")]
    DeadlineExceeded {
        path: PathBuf,
        operation: &'static str,
    },

    /// The caller cancelled the operation.
    #[error("plugin {path} {operation}: context cancelled")]
    Cancelled {
        path: PathBuf,
        operation: &'static str,
    },

    /// The connection broke: malformed reply, unexpected EOF, id mismatch.
    #[error("transport error talking to plugin {path}: {message}")]
    Transport { path: PathBuf, message: String },

    /// The RPC plugin does not offer the requested service.
    #[error("plugin {path} does not offer the {service:?} service: {message}")]
    ServiceUnavailable {
        path: PathBuf,
        service: &'static str,
        message: String,
    },

    /// The plugin ran but reported failure (non-zero exit or error reply).
    #[error("plugin {path} {operation} failed: {message}")]
    PluginReported {
        path: PathBuf,
        operation: &'static str,
        message: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// No accepted reply schema matched the plugin's output.
    #[error("failed to parse output of plugin {path}: {message}\nOutput: {output}")]
    Parse {
        path: PathBuf,
        message: String,
        output: String,
    },

    /// A request could not be serialised.
    #[error("failed to serialise plugin request: {0}")]
    Serialize(#[source] serde_json::Error),

    /// An I/O error while talking to the plugin process.
    #[error("I/O error communicating with plugin {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl PluginError {
    pub(crate) fn from_context(
        err: ContextError,
        path: impl Into<PathBuf>,
        operation: &'static str,
    ) -> Self {
        let path = path.into();
        match err {
            ContextError::Cancelled => Self::Cancelled { path, operation },
            ContextError::DeadlineExceeded => Self::DeadlineExceeded { path, operation },
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn transport(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Transport {
            path: path.into(),
            message: message.into(),
        }
    }

    /// True when the operation ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    /// True when the caller cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether a persistent connection that produced this error can no
    /// longer be trusted to be in sync and must be discarded.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Io { .. }
                | Self::DeadlineExceeded { .. }
                | Self::Cancelled { .. }
                | Self::Handshake { .. }
                | Self::Spawn { .. }
        )
    }

    /// Exit code of the plugin process, when the failure came from one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::PluginReported { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reported_error_is_attributable() {
        let err = PluginError::PluginReported {
            path: PathBuf::from("/opt/plugins/wob"),
            operation: "pre-execute",
            message: "exit code 3".into(),
            exit_code: Some(3),
            stderr: String::new(),
        };
        let text = err.to_string();
        assert!(text.contains("/opt/plugins/wob"));
        assert!(text.contains("pre-execute"));
        assert!(text.contains('3'));
        assert_eq!(err.exit_code(), Some(3));
        assert!(!err.poisons_connection());
    }

    #[test]
    fn context_errors_map_to_variants() {
        let err = PluginError::from_context(ContextError::DeadlineExceeded, "/bin/p", "generate");
        assert!(err.is_timeout());
        assert!(err.poisons_connection());

        let err = PluginError::from_context(ContextError::Cancelled, "/bin/p", "generate");
        assert!(err.is_cancelled());
        assert!(!err.is_timeout());
    }

    #[test]
    fn parse_error_includes_raw_output() {
        let err = PluginError::Parse {
            path: PathBuf::from("/bin/p"),
            message: "no accepted schema matched".into(),
            output: "not json".into(),
        };
        assert!(err.to_string().contains("Output: not json"));
    }
}
