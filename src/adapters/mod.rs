//! Transport adapters
//!
//! This module holds the byte-level link to the pump. A [`Transport`] knows how
//! to write raw bytes and read one terminator-delimited frame back; it has no
//! knowledge of the command protocol. A [`Connector`] opens a transport for a
//! port identifier.
//!
//! Implementations:
//! - [`SerialConnector`]: a real RS-232 port via the `serialport` crate
//!   (requires the `instrument_serial` feature)
//! - [`MockConnector`]: an in-process simulated pump for tests and dry runs

pub mod mock_adapter;
/// RS-232 transport on the `serialport` crate
#[cfg(feature = "instrument_serial")]
pub mod serial_adapter;

pub use mock_adapter::{MockConnector, MockPump, MockTransport};
#[cfg(feature = "instrument_serial")]
pub use serial_adapter::{SerialConnector, SerialTransport};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PumpResult;

/// Parity modes for serial communication
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity bit
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Line settings used when opening the pump's serial port.
#[derive(Clone, Debug, PartialEq)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Parity setting
    pub parity: SerialParity,
    /// Data bits (7 or 8)
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Maximum time allowed for one reply frame to arrive
    pub read_timeout: Duration,
}

impl Default for SerialSettings {
    /// 9600 baud, odd parity, 7 data bits, 1 stop bit, 10 s per frame.
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            parity: SerialParity::Odd,
            data_bits: 7,
            stop_bits: 1,
            read_timeout: Duration::from_secs(10),
        }
    }
}

/// Byte-oriented, request/reply link to the device.
///
/// Implementations must fail `read_until` with [`PumpError::Timeout`] when
/// the terminator does not arrive within their read timeout.
///
/// [`PumpError::Timeout`]: crate::error::PumpError::Timeout
#[async_trait]
pub trait Transport: Send {
    /// Write the full buffer to the device.
    async fn write(&mut self, bytes: &[u8]) -> PumpResult<()>;

    /// Read bytes until `terminator` is seen. The returned frame includes the terminator.
    async fn read_until(&mut self, terminator: u8) -> PumpResult<Vec<u8>>;

    /// Release the underlying resource.
    async fn close(&mut self) -> PumpResult<()>;

    /// Human-readable port name for log lines.
    fn port_name(&self) -> &str;
}

/// Opens transports. The session owns one connector for its whole lifetime.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open `port` with the given line settings.
    async fn open(&self, port: &str, settings: &SerialSettings) -> PumpResult<Box<dyn Transport>>;
}
