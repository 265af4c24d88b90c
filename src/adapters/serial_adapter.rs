use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serialport::SerialPort;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Connector, SerialParity, SerialSettings, Transport};
use crate::error::{PumpError, PumpResult};

/// Internal poll granularity of the OS-level read. The frame deadline is
/// enforced separately from `SerialSettings::read_timeout`.
const PORT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Opens real serial ports with the `serialport` crate.
#[derive(Clone, Debug, Default)]
pub struct SerialConnector;

#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self, port: &str, settings: &SerialSettings) -> PumpResult<Box<dyn Transport>> {
        let transport = SerialTransport::open(port, settings).await?;
        Ok(Box::new(transport))
    }
}

/// Serial transport for RS-232 communication
///
/// This wraps the serialport crate and provides async I/O using Tokio's
/// blocking task executor for synchronous serial operations.
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Maximum time for one reply frame
    read_timeout: Duration,

    /// The actual serial port (behind Arc<Mutex> for blocking-pool access)
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    /// Open `port_name` with the given line settings.
    ///
    /// # Errors
    /// Returns [`PumpError::Connection`] if the port cannot be opened.
    pub async fn open(port_name: &str, settings: &SerialSettings) -> PumpResult<Self> {
        let builder = serialport::new(port_name, settings.baud_rate)
            .parity(parity(settings.parity))
            .data_bits(data_bits(settings.data_bits)?)
            .stop_bits(stop_bits(settings.stop_bits)?)
            .flow_control(serialport::FlowControl::None)
            .timeout(PORT_POLL_TIMEOUT);

        let name = port_name.to_string();
        let port = tokio::task::spawn_blocking(move || builder.open())
            .await
            .map_err(std::io::Error::other)?
            .map_err(|e| PumpError::Connection {
                port: name,
                reason: e.to_string(),
            })?;

        debug!(
            port = port_name,
            baud = settings.baud_rate,
            "Serial port opened"
        );

        Ok(Self {
            port_name: port_name.to_string(),
            read_timeout: settings.read_timeout,
            port: Some(Arc::new(Mutex::new(port))),
        })
    }

    fn handle(&self) -> PumpResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port.clone().ok_or(PumpError::NotConnected)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, bytes: &[u8]) -> PumpResult<()> {
        let port = self.handle()?;
        let bytes = bytes.to_vec();

        // Execute blocking serial I/O on dedicated thread
        tokio::task::spawn_blocking(move || -> PumpResult<()> {
            let mut port_guard = port.blocking_lock();
            port_guard.write_all(&bytes)?;
            port_guard.flush()?;
            Ok(())
        })
        .await
        .map_err(std::io::Error::other)?
    }

    async fn read_until(&mut self, terminator: u8) -> PumpResult<Vec<u8>> {
        let port = self.handle()?;
        let timeout = self.read_timeout;

        tokio::task::spawn_blocking(move || -> PumpResult<Vec<u8>> {
            let mut port_guard = port.blocking_lock();

            // Accumulate one byte at a time until the terminator
            let mut frame = Vec::new();
            let mut buffer = [0u8; 1];
            let start = Instant::now();

            loop {
                if start.elapsed() > timeout {
                    return Err(PumpError::Timeout(timeout));
                }

                match port_guard.read(&mut buffer) {
                    Ok(1) => {
                        frame.push(buffer[0]);
                        if buffer[0] == terminator {
                            return Ok(frame);
                        }
                    }
                    Ok(0) => {
                        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        // Port timeout is shorter than the frame timeout
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                    Ok(_) => unreachable!("Read into single-byte buffer returned >1"),
                }
            }
        })
        .await
        .map_err(std::io::Error::other)?
    }

    async fn close(&mut self) -> PumpResult<()> {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "Serial port closed");
        }
        Ok(())
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }
}

fn parity(parity: SerialParity) -> serialport::Parity {
    match parity {
        SerialParity::None => serialport::Parity::None,
        SerialParity::Even => serialport::Parity::Even,
        SerialParity::Odd => serialport::Parity::Odd,
    }
}

fn data_bits(bits: u8) -> PumpResult<serialport::DataBits> {
    match bits {
        7 => Ok(serialport::DataBits::Seven),
        8 => Ok(serialport::DataBits::Eight),
        other => Err(PumpError::InvalidParameter(format!(
            "unsupported data bits: {other}"
        ))),
    }
}

fn stop_bits(bits: u8) -> PumpResult<serialport::StopBits> {
    match bits {
        1 => Ok(serialport::StopBits::One),
        2 => Ok(serialport::StopBits::Two),
        other => Err(PumpError::InvalidParameter(format!(
            "unsupported stop bits: {other}"
        ))),
    }
}
