//! Process-wide tracing setup.
//!
//! Console output goes to stderr; file output goes to a daily-rolling file
//! under the log directory through a non-blocking writer. `RUST_LOG`, when
//! set, overrides the configured level.

use crate::config::LoggingConfig;
use std::path::Path;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_FILE_PREFIX: &str = "vision.log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level '{level}': {reason}")]
    Level { level: String, reason: String },

    #[error("failed to create log directory {path}: {source}")]
    Dir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("global subscriber already installed: {0}")]
    Init(String),
}

/// Filter from `RUST_LOG` if present, else from the configured level.
pub fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| LoggingError::Level {
        level: level.to_string(),
        reason: e.to_string(),
    })
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; hold it for the
/// lifetime of the process.
pub fn init(config: &LoggingConfig, log_dir: &Path) -> Result<Option<WorkerGuard>, LoggingError> {
    let filter = build_filter(&config.level)?;

    let console = config
        .console_output
        .then(|| fmt::layer().with_target(false).with_writer(std::io::stderr));

    let (file, guard) = if config.file_output {
        std::fs::create_dir_all(log_dir).map_err(|source| LoggingError::Dir {
            path: log_dir.display().to_string(),
            source,
        })?;
        let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().with_ansi(false).with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;
    Ok(guard)
}
