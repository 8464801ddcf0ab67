//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level. Output goes to stderr unless
//! a log file is configured.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::AppError;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber described by `config`.
///
/// `level_override` replaces the configured level, e.g. from `-v` flags.
pub fn init_logging(config: &LoggingConfig, level_override: Option<&str>) -> Result<(), AppError> {
    let level = level_override.unwrap_or(config.level.as_str());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| AppError::Logging(format!("invalid filter '{level}': {e}")))?;

    let (writer, ansi) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| AppError::Logging(format!("{}: {e}", path.display())))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_thread_names(true)
        .with_ansi(ansi);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.map_err(|e| AppError::Logging(e.to_string()))
}

/// Map repeated `-v` flags to a filter level.
pub fn verbosity_level(count: u8) -> Option<&'static str> {
    match count {
        0 => None,
        1 => Some("debug"),
        _ => Some("trace"),
    }
}
