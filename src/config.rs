//! Configuration System using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. compiled-in defaults (the device's factory line settings and a 500 uL syringe)
//! 2. `config/pump.toml` (or the file passed to [`PumpConfig::load_from`])
//! 3. environment variables prefixed with `SYRINGE_PUMP_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! SYRINGE_PUMP_APPLICATION__LOG_LEVEL=debug
//! SYRINGE_PUMP_SERIAL__PORT=/dev/ttyUSB0
//! SYRINGE_PUMP_SYRINGE__VOLUME_UL=250
//! ```
//!
//! # Example
//!
//! ```no_run
//! use syringe_pump::config::PumpConfig;
//!
//! let config = PumpConfig::load().unwrap();
//! println!("Syringe: {} uL", config.syringe.volume_ul);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapters::{SerialParity, SerialSettings};
use crate::pump::planner::SyringeGeometry;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/pump.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "SYRINGE_PUMP_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be parsed
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values parsed but are not usable
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PumpConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial line settings
    #[serde(default)]
    pub serial: SerialConfig,
    /// Fitted syringe
    #[serde(default)]
    pub syringe: SyringeConfig,
    /// Status polling cadence
    #[serde(default)]
    pub polling: PollingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Append log lines to this file instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port (e.g., "/dev/ttyUSB0"); usually given on the command line
    #[serde(default)]
    pub port: Option<String>,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Parity (none, even, odd)
    #[serde(default = "default_parity")]
    pub parity: SerialParity,
    /// Data bits
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Stop bits
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Per-frame read timeout in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

/// Syringe configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyringeConfig {
    /// Steps in one full plunger stroke
    #[serde(default = "default_stroke_steps")]
    pub stroke_steps: u32,
    /// Syringe capacity in uL
    #[serde(default = "default_volume")]
    pub volume_ul: f64,
}

/// Busy-wait polling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Delay between status polls while waiting for the device, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    /// Delay between the kill and clear-queue commands of a stop, in milliseconds
    #[serde(default = "default_stop_settle")]
    pub stop_settle_ms: u64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "syringe-pump".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_parity() -> SerialParity {
    SerialParity::Odd
}

fn default_data_bits() -> u8 {
    7
}

fn default_stop_bits() -> u8 {
    1
}

fn default_read_timeout() -> u64 {
    10_000
}

fn default_stroke_steps() -> u32 {
    1000
}

fn default_volume() -> f64 {
    500.0
}

fn default_poll_interval() -> u64 {
    200
}

fn default_stop_settle() -> u64 {
    100
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            parity: default_parity(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

impl Default for SyringeConfig {
    fn default() -> Self {
        Self {
            stroke_steps: default_stroke_steps(),
            volume_ul: default_volume(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            stop_settle_ms: default_stop_settle(),
        }
    }
}

impl SerialConfig {
    /// Line settings for the transport.
    pub fn settings(&self) -> SerialSettings {
        SerialSettings {
            baud_rate: self.baud_rate,
            parity: self.parity,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }
}

impl SyringeConfig {
    /// Geometry of the configured syringe.
    pub fn geometry(&self) -> SyringeGeometry {
        SyringeGeometry {
            stroke_steps: self.stroke_steps,
            syringe_volume_ul: self.volume_ul,
        }
    }
}

impl PollingConfig {
    /// Poll interval as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Kill-to-clear delay as a duration.
    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl PumpConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or the result is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(PumpConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
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

        if self.serial.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "serial.baud_rate must be positive".to_string(),
            ));
        }
        if !matches!(self.serial.data_bits, 7 | 8) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid serial.data_bits {}. Must be 7 or 8",
                self.serial.data_bits
            )));
        }
        if !matches!(self.serial.stop_bits, 1 | 2) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid serial.stop_bits {}. Must be 1 or 2",
                self.serial.stop_bits
            )));
        }
        if self.serial.read_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "serial.read_timeout_ms must be positive".to_string(),
            ));
        }

        SyringeGeometry::new(self.syringe.stroke_steps, self.syringe.volume_ul)
            .map_err(|e| ConfigError::ValidationError(format!("syringe: {e}")))?;

        if self.polling.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "polling.interval_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_device_factory_settings() {
        let config = PumpConfig::default();
        let settings = config.serial.settings();
        assert_eq!(settings, SerialSettings::default());
        assert_eq!(config.syringe.geometry(), SyringeGeometry::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = PumpConfig::load_from("does/not/exist.toml").unwrap();
            assert_eq!(config, PumpConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_layering() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[serial]
port = "/dev/ttyUSB3"
read_timeout_ms = 2500

[syringe]
volume_ul = 250.0
"#
        )
        .unwrap();
        let path = file.path().to_path_buf();

        figment::Jail::expect_with(move |jail| {
            jail.set_env("SYRINGE_PUMP_APPLICATION__LOG_LEVEL", "debug");
            jail.set_env("SYRINGE_PUMP_POLLING__INTERVAL_MS", "50");

            let config = PumpConfig::load_from(&path).unwrap();
            assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyUSB3"));
            assert_eq!(config.serial.read_timeout_ms, 2500);
            assert_eq!(config.serial.baud_rate, 9600);
            assert_eq!(config.syringe.volume_ul, 250.0);
            assert_eq!(config.application.log_level, "debug");
            assert_eq!(config.polling.interval_ms, 50);
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = PumpConfig::default();
        config.syringe.volume_ul = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = PumpConfig::default();
        config.serial.data_bits = 6;
        assert!(config.validate().is_err());

        let mut config = PumpConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = PumpConfig::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("baud_rate = 9600"));
        assert!(rendered.contains("parity = \"odd\""));
    }
}
