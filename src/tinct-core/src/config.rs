use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

/// Longest plugin timeout accepted from config.toml: one day.
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub plugins: PluginSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            logging: LoggingConfig::default(),
            plugins: PluginSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    /// Mirror log lines to stderr; stdout stays reserved for command output.
    #[serde(default = "default_console_enabled")]
    pub console: bool,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            console: default_console_enabled(),
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Timeouts and policy applied when talking to external plugins.
///
/// Every plugin call additionally honours the caller's own deadline; the
/// effective bound of a hook is the smaller of the two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Upper bound for the `--plugin-info` query used during detection.
    #[serde(default = "default_detect_timeout_secs")]
    pub detect_timeout_secs: u64,
    /// Upper bound for an RPC plugin to print its handshake line.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_pre_execute_timeout_secs")]
    pub pre_execute_timeout_secs: u64,
    #[serde(default = "default_post_execute_timeout_secs")]
    pub post_execute_timeout_secs: u64,
    /// Refuse plugins whose declared protocol version is incompatible.
    #[serde(default = "default_enforce_protocol_version")]
    pub enforce_protocol_version: bool,
    /// Relay plugin stderr into the host log.
    #[serde(default)]
    pub forward_stderr: bool,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            detect_timeout_secs: default_detect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            pre_execute_timeout_secs: default_pre_execute_timeout_secs(),
            post_execute_timeout_secs: default_post_execute_timeout_secs(),
            enforce_protocol_version: default_enforce_protocol_version(),
            forward_stderr: false,
        }
    }
}

impl PluginSettings {
    pub fn detect_timeout(&self) -> Duration {
        Duration::from_secs(self.detect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn pre_execute_timeout(&self) -> Duration {
        Duration::from_secs(self.pre_execute_timeout_secs)
    }

    pub fn post_execute_timeout(&self) -> Duration {
        Duration::from_secs(self.post_execute_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("detect_timeout_secs", self.detect_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("pre_execute_timeout_secs", self.pre_execute_timeout_secs),
            ("post_execute_timeout_secs", self.post_execute_timeout_secs),
        ] {
            if value == 0 {
                return Err(ValidationError::ZeroTimeout { field });
            }
            if value > MAX_TIMEOUT_SECS {
                return Err(ValidationError::TimeoutTooLong {
                    field,
                    max: MAX_TIMEOUT_SECS,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("plugins.{field} must be greater than zero")]
    ZeroTimeout { field: &'static str },
    #[error("plugins.{field} must be at most {max} seconds")]
    TimeoutTooLong { field: &'static str, max: u64 },
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }
        self.plugins.validate()
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}

fn default_console_enabled() -> bool {
    true
}

fn default_detect_timeout_secs() -> u64 {
    5
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_pre_execute_timeout_secs() -> u64 {
    5
}

fn default_post_execute_timeout_secs() -> u64 {
    10
}

fn default_enforce_protocol_version() -> bool {
    true
}
