use crate::{config::LoggingConfig, paths::AppDirs};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LOG_FILE: &str = "tinct.log";

/// Keeps the background log writer alive; drop it last so buffered lines
/// reach the file.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Installs the global subscriber: a daily-rolling file under the log
/// directory, optionally mirrored to stderr.
pub fn init_logging(config: &LoggingConfig, dirs: &AppDirs) -> Result<LoggingGuard, LoggingError> {
    let log_dir = dirs.log_dir();
    fs::create_dir_all(log_dir).map_err(|source| LoggingError::LogDirectory {
        path: log_dir.to_path_buf(),
        source,
    })?;

    let filter = filter_for(config)?;
    let file_stem = config.file_name.as_deref().unwrap_or(DEFAULT_LOG_FILE);
    let removed = rotate(log_dir, file_stem, config.max_log_files.max(1))?;

    let (file, file_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, file_stem));
    let writer = if config.console {
        BoxMakeWriter::new(std::io::stderr.and(file))
    } else {
        BoxMakeWriter::new(file)
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(LoggingError::Install)?;

    for path in removed {
        tracing::debug!(path = %path.display(), "removed old log file");
    }
    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// `RUST_LOG` overrides the configured level, so one target (say
/// `tinct_plugin::rpc`) can be raised without touching config.toml.
fn filter_for(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = config.level.as_filter_directive();
    EnvFilter::try_new(directive).map_err(|source| LoggingError::Filter {
        directive: directive.to_string(),
        source,
    })
}

/// Deletes all but the newest `keep` files named `<file_stem>*` in `dir`.
fn rotate(dir: &Path, file_stem: &str, keep: usize) -> Result<Vec<PathBuf>, LoggingError> {
    let listing = fs::read_dir(dir).map_err(|source| LoggingError::Rotate {
        path: dir.to_path_buf(),
        source,
    })?;
    let logs = listing.flatten().filter_map(|entry| {
        if !entry.file_name().to_string_lossy().starts_with(file_stem) {
            return None;
        }
        let modified = entry.metadata().and_then(|meta| meta.modified()).ok()?;
        Some((entry.path(), modified))
    });

    let stale = oldest_beyond(logs.collect(), keep);
    for path in &stale {
        fs::remove_file(path).map_err(|source| LoggingError::Rotate {
            path: path.clone(),
            source,
        })?;
    }
    Ok(stale)
}

fn oldest_beyond(mut logs: Vec<(PathBuf, SystemTime)>, keep: usize) -> Vec<PathBuf> {
    logs.sort_by(|a, b| b.1.cmp(&a.1));
    logs.into_iter().skip(keep).map(|(path, _)| path).collect()
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}: {source}")]
    LogDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter {directive:?}: {source}")]
    Filter {
        directive: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("failed to install tracing subscriber: {0}")]
    Install(Box<dyn std::error::Error + Send + Sync>),
    #[error("failed to rotate log file {path}: {source}")]
    Rotate {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn oldest_files_beyond_the_limit_are_stale() {
        let base = SystemTime::UNIX_EPOCH;
        let logs = (1..=4)
            .map(|day| {
                (
                    PathBuf::from(format!("tinct.log.2026-01-0{day}")),
                    base + Duration::from_secs(day * 86_400),
                )
            })
            .collect();
        assert_eq!(
            oldest_beyond(logs, 2),
            vec![
                PathBuf::from("tinct.log.2026-01-02"),
                PathBuf::from("tinct.log.2026-01-01"),
            ]
        );
        assert!(oldest_beyond(Vec::new(), 3).is_empty());
    }

    #[test]
    fn rotate_only_touches_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=3 {
            fs::write(dir.path().join(format!("tinct.log.2026-01-0{day}")), "line").unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
        fs::write(dir.path().join("unrelated.txt"), "keep").unwrap();

        let removed = rotate(dir.path(), "tinct.log", 1).unwrap();
        assert_eq!(removed.len(), 2);

        let mut remaining: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(remaining, ["tinct.log.2026-01-03", "unrelated.txt"]);
    }
}
