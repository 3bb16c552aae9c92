//! Logging setup and operation timing.
//!
//! The crate logs through the `log` facade; `init_logging` installs
//! `env_logger` as the backend. `RUST_LOG` still refines the configured level.

use crate::{HdError, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Trace => write!(f, "TRACE"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = HdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(HdError::Config(format!("Unknown log level: {}", other))),
        }
    }
}

/// Install `env_logger` as the global logger.
///
/// Returns `false` if a logger was already installed, which is not an error:
/// embedding applications commonly bring their own.
pub fn init_logging(level: Option<LogLevel>) -> bool {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level.map(LevelFilter::from).unwrap_or(LevelFilter::Info));
    builder.parse_default_env();
    builder.try_init().is_ok()
}

/// Logs the elapsed time of an operation at debug level when dropped.
pub struct OperationTimer {
    operation: String,
    started: Instant,
}

impl OperationTimer {
    pub fn start(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            started: Instant::now(),
        }
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        log::debug!("{} finished in {:?}", self.operation, self.started.elapsed());
    }
}
