//! Custom error types for the pump driver.
//!
//! This module defines the primary error type, `PumpError`, for the whole crate.
//! Using the `thiserror` crate, it provides one consistent taxonomy for failures
//! that can occur while talking to the pump, from an unavailable serial port to a
//! malformed reply frame.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: the serial port could not be opened. Terminal for that
//!   connect attempt; the session stays disconnected and any retry is up to the caller.
//! - **`Timeout`**: the device did not finish a reply frame within the read timeout.
//! - **`Protocol`**: a reply frame was malformed or carried an unexpected value,
//!   including an unrecognized status character.
//! - **`RateOutOfRange`** / **`VolumeExceedsCapacity`** / **`InvalidParameter`**:
//!   request validation failures. These are raised before any device I/O, so
//!   retrying with corrected parameters is always safe.
//! - **`NotConnected`** / **`InvalidState`** / **`OperationInProgress`**: the
//!   request is not valid for the session's current state.
//! - **`Io`** / **`Config`**: wrapped errors from the standard library and the
//!   configuration loader.
//! - **`Logging`**: the global log subscriber could not be installed.
//!
//! No variant triggers an automatic retry anywhere in the crate.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the crate error type.
pub type PumpResult<T> = std::result::Result<T, PumpError>;

/// Every failure the driver can report.
#[derive(Error, Debug)]
pub enum PumpError {
    /// The serial port could not be opened.
    #[error("Unable to connect to '{port}': {reason}")]
    Connection {
        /// Port identifier the caller supplied
        port: String,
        /// Underlying reason reported by the transport
        reason: String,
    },

    /// No complete reply frame arrived within the read timeout.
    #[error("Device did not reply within {0:?}")]
    Timeout(Duration),

    /// A reply frame was malformed or unexpected.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The requested flow rate maps to a stroke duration the device cannot run.
    #[error(
        "Flow rate {rate_ul_per_min} uL/min gives {seconds_per_stroke} s per full stroke (valid range 1-250 s)"
    )]
    RateOutOfRange {
        /// Requested flow rate in microlitres per minute
        rate_ul_per_min: f64,
        /// Resulting seconds per full stroke
        seconds_per_stroke: f64,
    },

    /// A single stroke was asked to move more than the syringe holds.
    #[error("Unable to pump {volume_ul} uL as this is greater than the syringe volume of {capacity_ul} uL")]
    VolumeExceedsCapacity {
        /// Requested stroke volume
        volume_ul: f64,
        /// Syringe capacity
        capacity_ul: f64,
    },

    /// A request parameter is not usable (non-positive volume, bad channel name, ...).
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The operation needs an open connection.
    #[error("Pump is not connected")]
    NotConnected,

    /// The operation is not valid in the pump's current state.
    #[error("Cannot {operation} while pump is {state}")]
    InvalidState {
        /// Operation that was rejected
        operation: &'static str,
        /// Pump state at the time of the request
        state: String,
    },

    /// Another long-running operation already owns the device.
    #[error("Another pump operation is already in progress")]
    OperationInProgress,

    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The log subscriber could not be installed.
    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl PumpError {
    /// True when the error was raised by request validation, before any byte
    /// was written to the device.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PumpError::RateOutOfRange { .. }
                | PumpError::VolumeExceedsCapacity { .. }
                | PumpError::InvalidParameter(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PumpError::VolumeExceedsCapacity {
            volume_ul: 600.0,
            capacity_ul: 500.0,
        };
        assert_eq!(
            err.to_string(),
            "Unable to pump 600 uL as this is greater than the syringe volume of 500 uL"
        );
    }

    #[test]
    fn test_validation_errors_are_flagged() {
        assert!(PumpError::RateOutOfRange {
            rate_ul_per_min: 100.0,
            seconds_per_stroke: 300.0,
        }
        .is_validation());
        assert!(PumpError::InvalidParameter("volume".into()).is_validation());
        assert!(!PumpError::Timeout(Duration::from_secs(10)).is_validation());
        assert!(!PumpError::Protocol("short frame".into()).is_validation());
        assert!(!PumpError::Logging("already installed".into()).is_validation());
    }
}
