pub mod config;
pub mod logging;
pub mod paths;

pub use config::{
    Config, ConfigError, LogLevel, LoggingConfig, PluginSettings, ValidationError, MAX_TIMEOUT_SECS,
};
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use paths::{AppDirs, DirsError};

pub const APP_NAME: &str = "tinct";
pub const APP_AUTHOR: &str = "Tinct";
pub const APP_QUALIFIER: &str = "io";
