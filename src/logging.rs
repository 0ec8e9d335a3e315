//! Diagnostic logging through `tracing`.
//!
//! Everything goes to stderr; stdout carries event lines only.
//!
//! - `RUST_LOG`: filter directives (e.g. `rwatch=debug`). Takes precedence
//!   over `--log-level`.
//! - `RWATCH_LOG_FORMAT`: `pretty` (default) or `json`. Takes precedence
//!   over `--log-format`.

use std::io::{self, IsTerminal};
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub const FORMAT_ENV: &str = "RWATCH_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Build the filter: `RUST_LOG` if set and valid, else `level`, else WARN.
fn build_filter(rust_log: Option<&str>, level: Option<LogLevel>) -> EnvFilter {
    let fallback = || {
        let level = level.map(Level::from).unwrap_or(Level::WARN);
        EnvFilter::new(level.as_str().to_lowercase())
    };
    match rust_log {
        Some(directives) if !directives.trim().is_empty() => {
            EnvFilter::try_new(directives).unwrap_or_else(|_| fallback())
        }
        _ => fallback(),
    }
}

/// Pick the output format: the environment wins over the flag.
fn resolve_format(env_format: Option<&str>, format: Option<LogFormat>) -> LogFormat {
    env_format
        .and_then(|s| s.parse().ok())
        .or(format)
        .unwrap_or_default()
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails if a subscriber is already installed.
pub fn init_logging(level: Option<LogLevel>, format: Option<LogFormat>) -> Result<(), LoggingError> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let env_format = std::env::var(FORMAT_ENV).ok();
    let filter = build_filter(rust_log.as_deref(), level);

    let layer = match resolve_format(env_format.as_deref(), format) {
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_ansi(io::stderr().is_terminal())
            .with_writer(io::stderr)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_writer(io::stderr)
            .with_filter(filter)
            .boxed(),
    };

    Registry::default()
        .with(layer)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log format: {0} (use 'pretty' or 'json')")]
    InvalidFormat(String),

    #[error("invalid log level: {0} (use error, warn, info, debug or trace)")]
    InvalidLevel(String),

    #[error("failed to initialize logging: {0}")]
    InitializationFailed(String),
}
