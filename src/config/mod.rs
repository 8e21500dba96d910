//! Configuration.
//!
//! [`LinkConfig`] is loaded with Figment from (highest precedence first):
//! 1. Environment variables prefixed with `INSTRUMENT_LINK_`, nested keys
//!    split on `__` (`INSTRUMENT_LINK_TIMEOUTS__QUICK_MS=300`)
//! 2. TOML file (default: `instrument_link.toml`)
//!
//! Durations are plain milliseconds in the file.
//!
//! ```toml
//! [application]
//! name = "bench"
//! log_level = "debug"
//!
//! [timeouts]
//! quick_ms = 200
//! readout_ms = 500
//!
//! [coincidence]
//! port = "/dev/ttyACM1"
//! sampling_period_ms = 400
//! ```
//!
//! The scan parameter file written by the acquisition GUI is a separate
//! plain text format, see [`scan`].

pub mod scan;

pub use scan::ScanParameters;

use crate::acquisition::AcquisitionConfig;
use crate::drivers::dmd::{PanelSize, DLPC900_PRODUCT_ID, DLPC900_VENDOR_ID};
use crate::error::LinkError;
use crate::exchange::ExchangeTimeouts;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "instrument_link.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "INSTRUMENT_LINK_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value parsed but is out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
    /// The configuration could not be rendered as TOML.
    #[error("Configuration serialization error: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

impl From<ConfigError> for LinkError {
    fn from(e: ConfigError) -> Self {
        LinkError::Config(e.to_string())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Exchange deadlines per command class
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Piezo stage board
    #[serde(default)]
    pub piezo: Option<SerialBoardConfig>,
    /// Laser-PID photodiode board
    #[serde(default)]
    pub photodiode: Option<SerialBoardConfig>,
    /// Coincidence counter board
    #[serde(default)]
    pub coincidence: Option<CoincidenceBoardConfig>,
    /// DMD projector
    #[serde(default)]
    pub dmd: Option<DmdConfig>,
    /// Live acquisition loops
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Exchange deadlines in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Status queries, version, handshakes
    #[serde(default = "default_quick_ms")]
    pub quick_ms: u64,
    /// Stage and mirror moves
    #[serde(default = "default_motion_ms")]
    pub motion_ms: u64,
    /// Open-loop capture start
    #[serde(default = "default_capture_ms")]
    pub capture_ms: u64,
    /// Data readouts
    #[serde(default = "default_readout_ms")]
    pub readout_ms: u64,
    /// Sleep between receive polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// One serial board
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialBoardConfig {
    /// Serial port (e.g., "/dev/ttyACM0" or "COM3")
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// Coincidence counter board
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoincidenceBoardConfig {
    /// Serial port
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Integration period sent with `!T:<ms>?` after connecting
    #[serde(default = "default_sampling_period_ms")]
    pub sampling_period_ms: u32,
    /// Stream 18-byte binary records instead of ASCII frames
    #[serde(default)]
    pub legacy_binary: bool,
}

/// DMD projector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmdConfig {
    /// USB vendor id
    #[serde(default = "default_dmd_vendor_id")]
    pub vendor_id: u16,
    /// USB product id
    #[serde(default = "default_dmd_product_id")]
    pub product_id: u16,
    /// Panel width in pixels
    #[serde(default = "default_panel_width")]
    pub width: u16,
    /// Panel height in pixels
    #[serde(default = "default_panel_height")]
    pub height: u16,
    /// USB transfer timeout in milliseconds
    #[serde(default = "default_usb_timeout_ms")]
    pub usb_timeout_ms: u64,
}

/// Live acquisition loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Time between samples in milliseconds
    #[serde(default = "default_cadence_ms")]
    pub cadence_ms: u64,
    /// Samples buffered for a slow consumer
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Timeouts in a row before a loop gives up
    #[serde(default = "default_max_consecutive_timeouts")]
    pub max_consecutive_timeouts: u32,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "instrument_link".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_quick_ms() -> u64 {
    200
}

fn default_motion_ms() -> u64 {
    1000
}

fn default_capture_ms() -> u64 {
    2000
}

fn default_readout_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_sampling_period_ms() -> u32 {
    100
}

fn default_dmd_vendor_id() -> u16 {
    DLPC900_VENDOR_ID
}

fn default_dmd_product_id() -> u16 {
    DLPC900_PRODUCT_ID
}

fn default_panel_width() -> u16 {
    PanelSize::DLP6500.width
}

fn default_panel_height() -> u16 {
    PanelSize::DLP6500.height
}

fn default_usb_timeout_ms() -> u64 {
    1000
}

fn default_cadence_ms() -> u64 {
    100
}

fn default_buffer_capacity() -> usize {
    64
}

fn default_max_consecutive_timeouts() -> u32 {
    3
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            quick_ms: default_quick_ms(),
            motion_ms: default_motion_ms(),
            capture_ms: default_capture_ms(),
            readout_ms: default_readout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            cadence_ms: default_cadence_ms(),
            buffer_capacity: default_buffer_capacity(),
            max_consecutive_timeouts: default_max_consecutive_timeouts(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            timeouts: TimeoutConfig::default(),
            piezo: None,
            photodiode: None,
            coincidence: None,
            dmd: None,
            acquisition: AcquisitionSettings::default(),
        }
    }
}

impl TimeoutConfig {
    /// Deadlines for [`crate::exchange::Link`].
    pub fn to_exchange_timeouts(&self) -> ExchangeTimeouts {
        ExchangeTimeouts {
            quick: Duration::from_millis(self.quick_ms),
            motion: Duration::from_millis(self.motion_ms),
            capture: Duration::from_millis(self.capture_ms),
            readout: Duration::from_millis(self.readout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

impl AcquisitionSettings {
    /// Loop tuning for a loop named `owner`.
    pub fn to_acquisition_config(&self, owner: &str) -> AcquisitionConfig {
        AcquisitionConfig {
            cadence: Duration::from_millis(self.cadence_ms),
            capacity: self.buffer_capacity,
            max_consecutive_timeouts: self.max_consecutive_timeouts,
            owner: owner.to_string(),
        }
    }
}

impl DmdConfig {
    /// Panel resolution.
    pub fn panel(&self) -> PanelSize {
        PanelSize {
            width: self.width,
            height: self.height,
        }
    }

    /// USB transfer timeout.
    pub fn usb_timeout(&self) -> Duration {
        Duration::from_millis(self.usb_timeout_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl LinkConfig {
    /// Load from [`DEFAULT_CONFIG_FILE`] and the environment.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the configuration cannot be read or fails
    /// validation.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error; every section has defaults.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string without touching the environment.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new().merge(Toml::string(text)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Every deadline is positive and the poll interval is shorter than
    ///   the quick deadline
    /// - Configured boards name a port and a positive baud rate
    /// - Coincidence sampling period is 1..=60000 ms
    /// - Panel size and acquisition buffer are non-zero
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("quick_ms", t.quick_ms),
            ("motion_ms", t.motion_ms),
            ("capture_ms", t.capture_ms),
            ("readout_ms", t.readout_ms),
            ("poll_interval_ms", t.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "timeouts.{name} must be positive"
                )));
            }
        }
        if t.poll_interval_ms >= t.quick_ms {
            return Err(ConfigError::ValidationError(format!(
                "timeouts.poll_interval_ms ({}) must be shorter than quick_ms ({})",
                t.poll_interval_ms, t.quick_ms
            )));
        }

        for (name, board) in [("piezo", &self.piezo), ("photodiode", &self.photodiode)] {
            if let Some(board) = board {
                validate_serial(name, &board.port, board.baud_rate)?;
            }
        }
        if let Some(board) = &self.coincidence {
            validate_serial("coincidence", &board.port, board.baud_rate)?;
            if board.sampling_period_ms == 0
                || board.sampling_period_ms > crate::drivers::coincidence::MAX_PERIOD_MS
            {
                return Err(ConfigError::ValidationError(format!(
                    "coincidence.sampling_period_ms {} outside 1..={}",
                    board.sampling_period_ms,
                    crate::drivers::coincidence::MAX_PERIOD_MS
                )));
            }
        }

        if let Some(dmd) = &self.dmd {
            if dmd.width == 0 || dmd.height == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid DMD panel size {}x{}",
                    dmd.width, dmd.height
                )));
            }
        }

        if self.acquisition.buffer_capacity == 0 || self.acquisition.cadence_ms == 0 {
            return Err(ConfigError::ValidationError(
                "acquisition.buffer_capacity and acquisition.cadence_ms must be positive".into(),
            ));
        }

        Ok(())
    }
}

fn validate_serial(section: &str, port: &str, baud_rate: u32) -> Result<(), ConfigError> {
    if port.trim().is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "{section}.port must not be empty"
        )));
    }
    if baud_rate == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{section}.baud_rate must be positive"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeouts.to_exchange_timeouts(), ExchangeTimeouts::default());
    }

    #[test]
    fn test_sections_parse_with_defaults() {
        let config = LinkConfig::from_toml_str(
            r#"
            [timeouts]
            quick_ms = 300

            [coincidence]
            port = "/dev/ttyACM1"
            sampling_period_ms = 400

            [dmd]
            width = 912
            height = 1140
            "#,
        )
        .unwrap();

        assert_eq!(config.timeouts.quick_ms, 300);
        assert_eq!(config.timeouts.readout_ms, 500);
        let coincidence = config.coincidence.unwrap();
        assert_eq!(coincidence.baud_rate, 115_200);
        assert!(!coincidence.legacy_binary);
        let dmd = config.dmd.unwrap();
        assert_eq!(dmd.vendor_id, 0x0451);
        assert_eq!(dmd.panel(), PanelSize { width: 912, height: 1140 });
        assert!(config.piezo.is_none());
    }

    #[test]
    fn test_invalid_log_level() {
        let err = LinkConfig::from_toml_str("[application]\nlog_level = \"loud\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_poll_interval_must_be_shorter_than_quick() {
        let err = LinkConfig::from_toml_str("[timeouts]\nquick_ms = 10\npoll_interval_ms = 10\n")
            .unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn test_zero_sampling_period() {
        let err = LinkConfig::from_toml_str(
            "[coincidence]\nport = \"COM4\"\nsampling_period_ms = 0\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_empty_port() {
        let err = LinkConfig::from_toml_str("[piezo]\nport = \" \"\n").unwrap_err();
        assert!(err.to_string().contains("piezo.port"));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = LinkConfig::default();
        config.photodiode = Some(SerialBoardConfig {
            port: "/dev/ttyACM0".into(),
            baud_rate: 115_200,
        });
        let text = config.to_toml_string().unwrap();
        assert_eq!(LinkConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_config_error_maps_to_link_error() {
        let err: LinkError = ConfigError::ValidationError("bad".into()).into();
        assert!(matches!(err, LinkError::Config(_)));
    }
}
