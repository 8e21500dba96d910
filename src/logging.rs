//! Tracing setup.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and one fmt
//! layer. `RUST_LOG` takes precedence over the configured level, so
//! `RUST_LOG=instrument_link::exchange=trace` shows wire bytes for one run
//! without touching the config file.
//!
//! Level conventions used across the crate:
//! - `trace`: raw bytes written and read, discarded line noise
//! - `debug`: completed exchanges, stale input dropped before a write
//! - `info`: ports opened and closed, boards identified, loops started
//! - `warn`: timeouts, refused commands, lagging consumers
//!
//! ```no_run
//! use instrument_link::config::LinkConfig;
//! use instrument_link::logging;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LinkConfig::load()?;
//! logging::init_from_config(&config)?;
//! # Ok(())
//! # }
//! ```

use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line, colored (bench use)
    #[default]
    Pretty,
    /// One line per event, no colors
    Compact,
    /// JSON lines for log collection
    Json,
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// ANSI colors (pretty only)
    pub with_ansi: bool,
    /// Thread names in each event
    pub with_thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_ansi: true,
            with_thread_names: true,
        }
    }
}

impl LoggingConfig {
    /// Options at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize from the `[application]` log level.
pub fn init_from_config(config: &LinkConfig) -> LinkResult<()> {
    let level = parse_log_level(&config.application.log_level)?;
    init(LoggingConfig::new(level))
}

/// Install the global subscriber.
///
/// Calling this again once a subscriber is installed is a no-op.
pub fn init(config: LoggingConfig) -> LinkResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_ansi(config.with_ansi)
            .with_thread_names(config.with_thread_names)
            .with_filter(filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_thread_names(config.with_thread_names)
            .with_filter(filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_thread_names(config.with_thread_names)
            .with_filter(filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(LinkError::Config(format!("failed to initialize tracing: {e}"))),
    }
}

/// Parse a level name.
///
/// # Errors
/// [`LinkError::Config`] for anything but trace, debug, info, warn, error.
pub fn parse_log_level(level: &str) -> LinkResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(LinkError::Config(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}
