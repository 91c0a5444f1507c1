//! Logging setup
//!
//! Structured logging through `tracing`, with `tracing-subscriber` doing the
//! formatting. `RUST_LOG` overrides the configured level when set.
//!
//! # Example
//! ```no_run
//! use tomo_daq::{config::SessionConfig, logging};
//! use tracing::info;
//!
//! let config = SessionConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!(beamline = %config.session.beamline_id, "Session started");
//! # Ok::<(), tomo_daq::error::TomoError>(())
//! ```

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::SessionConfig;
use crate::error::{AppResult, TomoError};

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Multi-line, coloured (interactive use)
    #[default]
    Pretty,
    /// One line per event, no colours
    Compact,
    /// JSON objects (log aggregation)
    Json,
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Maximum level
    pub level: Level,
    /// Line format
    pub format: LogFormat,
    /// Log span open/close (run and phase boundaries)
    pub with_span_events: bool,
    /// Include file and line numbers
    pub with_file_and_line: bool,
    /// Colour output (pretty format only)
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Options with the session's log level
    pub fn from_session_config(config: &SessionConfig) -> AppResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.session.log_level)?,
            ..Default::default()
        })
    }

    /// Set line format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }
}

/// Initialize logging from the session configuration
pub fn init_from_config(config: &SessionConfig) -> AppResult<()> {
    init(LoggingConfig::from_session_config(config)?)
}

/// Initialize logging
///
/// Calling this again once a subscriber is installed is a no-op.
pub fn init(config: LoggingConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_ascii_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_filter(env_filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // Already initialized (tests, embedding applications)
        Err(e) if e.to_string().contains("already") => Ok(()),
        Err(e) => Err(TomoError::InvalidConfig(format!(
            "failed to initialize logging: {}",
            e
        ))),
    }
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(TomoError::InvalidConfig(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_from_session_config() {
        let mut config = SessionConfig::default();
        config.session.log_level = "trace".to_string();
        let logging = LoggingConfig::from_session_config(&config).unwrap();
        assert_eq!(logging.level, Level::TRACE);
        assert_eq!(logging.format, LogFormat::Pretty);
    }

    // `test_init_twice_is_ok` lives in tests/logging_test.rs: it installs a
    // process-global subscriber, which conflicts with `#[traced_test]` here.
}
