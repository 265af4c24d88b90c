//! Simulated Pump
//!
//! Provides an in-process stand-in for the dual-syringe pump so the driver can be
//! exercised without hardware. The simulation speaks the same frame protocol as
//! the device:
//!
//! - every command is answered with an echo frame followed by a data frame
//!   (the firmware query answers with a single frame)
//! - data frames start with a marker byte; the payload begins at offset 1
//! - motion commands update the simulated plunger positions immediately and keep
//!   the device busy for a configurable number of status polls
//!
//! # Example
//!
//! ```rust,ignore
//! let pump = MockPump::new();
//! let session = PumpSession::new(Arc::new(MockConnector::new(pump.clone())), config);
//! session.connect("sim").await?;
//! assert_eq!(pump.written_frames()[0], "1a\r");
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Connector, SerialSettings, Transport};
use crate::error::{PumpError, PumpResult};

/// First byte of every data frame produced by the simulation.
pub const REPLY_MARKER: u8 = b'`';

/// Firmware string reported by the simulation.
pub const MOCK_FIRMWARE: &str = "SIM-PSD v1.0";

/// Full-stroke step count of the simulated syringes.
const MOCK_STROKE_STEPS: f64 = 1000.0;

#[derive(Debug)]
struct MockPumpState {
    /// Plunger positions for sub-addresses B and C
    positions: [f64; 2],
    /// Busy polls to report after each motion/reset command
    busy_polls_per_command: u32,
    busy_remaining: u32,
    /// Pending bytes the transport will hand out on read
    outbox: VecDeque<u8>,
    /// Status characters to report instead of the simulated state
    scripted_status: VecDeque<u8>,
    /// Every frame written by the driver, in order
    written: Vec<String>,
    fail_open: bool,
    silent: bool,
    open: bool,
}

/// Shared handle to the simulated device. Clones observe and control the same pump.
#[derive(Clone, Debug)]
pub struct MockPump {
    state: Arc<Mutex<MockPumpState>>,
}

impl Default for MockPump {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPump {
    /// Create an idle pump with both syringes empty.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockPumpState {
                positions: [0.0, 0.0],
                busy_polls_per_command: 1,
                busy_remaining: 0,
                outbox: VecDeque::new(),
                scripted_status: VecDeque::new(),
                written: Vec::new(),
                fail_open: false,
                silent: false,
                open: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockPumpState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of `*` replies after each motion or reset command.
    pub fn with_busy_polls(self, polls: u32) -> Self {
        self.lock().busy_polls_per_command = polls;
        self
    }

    /// Set the plunger positions (in steps) of logical syringes A and B.
    pub fn set_positions(&self, steps_a: f64, steps_b: f64) {
        self.lock().positions = [steps_a, steps_b];
    }

    /// Current plunger positions of logical syringes A and B.
    pub fn positions(&self) -> (f64, f64) {
        let state = self.lock();
        (state.positions[0], state.positions[1])
    }

    /// Queue status characters that override the simulated status for the next polls.
    pub fn script_status(&self, chars: &[u8]) {
        self.lock().scripted_status.extend(chars.iter().copied());
    }

    /// Make the next `open` fail as if the port did not exist.
    pub fn fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Stop answering; every read then times out.
    pub fn go_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// True while a transport is open on this pump.
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Every frame written so far, decoded as text.
    pub fn written_frames(&self) -> Vec<String> {
        self.lock().written.clone()
    }

    /// Total number of bytes written so far.
    pub fn bytes_written(&self) -> usize {
        self.lock().written.iter().map(String::len).sum()
    }

    /// Forget the write log.
    pub fn clear_written(&self) {
        self.lock().written.clear();
    }

    fn handle_frame(state: &mut MockPumpState, frame: &str) {
        let body = frame.trim_end_matches('\r');
        state.written.push(frame.to_string());
        if state.silent {
            return;
        }

        let data: Option<String> = match body {
            "1a" => Some(String::new()),
            "aXR" => {
                state.positions = [0.0, 0.0];
                state.busy_remaining = state.busy_polls_per_command;
                Some(String::new())
            }
            "aF" => {
                let status = state.scripted_status.pop_front().unwrap_or_else(|| {
                    if state.busy_remaining > 0 {
                        state.busy_remaining -= 1;
                        b'*'
                    } else {
                        b'Y'
                    }
                });
                Some((status as char).to_string())
            }
            "aK" | "aV" => {
                state.busy_remaining = 0;
                Some(String::new())
            }
            "aH" => Some("1".to_string()),
            "aJ" => Some("0".to_string()),
            "aBYQP" => Some(format!("{}", state.positions[0])),
            "aCYQP" => Some(format!("{}", state.positions[1])),
            "aU" => {
                let mut reply = vec![REPLY_MARKER];
                reply.extend_from_slice(MOCK_FIRMWARE.as_bytes());
                reply.push(b'\r');
                state.outbox.extend(reply);
                return;
            }
            _ => match apply_move(state, body) {
                Ok(()) => {
                    state.busy_remaining = state.busy_polls_per_command;
                    Some(String::new())
                }
                Err(reason) => {
                    debug!(frame = body, %reason, "Simulated pump rejected frame");
                    None
                }
            },
        };

        state.outbox.extend(body.bytes());
        state.outbox.push_back(b'\r');
        let mut reply = vec![REPLY_MARKER];
        reply.extend_from_slice(data.unwrap_or_else(|| "?".to_string()).as_bytes());
        reply.push(b'\r');
        state.outbox.extend(reply);
    }
}

/// Apply a move frame such as `aBIP400S30N5OCIP400S30N5OR`.
fn apply_move(state: &mut MockPumpState, body: &str) -> Result<(), String> {
    let rest = body
        .strip_prefix('a')
        .and_then(|b| b.strip_suffix('R'))
        .ok_or_else(|| "not a move frame".to_string())?;

    let mut chars = rest.chars();
    let mut moves = Vec::new();
    while let Some(sub) = chars.next() {
        let index = match sub {
            'B' => 0,
            'C' => 1,
            other => return Err(format!("unknown sub-address {other}")),
        };
        let op = chars.next().ok_or("missing operation")?;
        let program: String = chars.by_ref().take_while(|c| *c != 'O').collect();
        moves.push((index, op, program));
    }
    if moves.is_empty() {
        return Err("empty move".to_string());
    }

    for (index, op, program) in moves {
        let position = &mut state.positions[index];
        match (op, program.chars().next()) {
            ('I', Some('P')) => *position += program_value(&program, 'P')?,
            ('O', Some('M')) => *position = program_value(&program, 'M')?,
            ('O', Some('P')) => *position -= program_value(&program, 'P')?,
            _ => return Err(format!("unsupported program {op}{program}")),
        }
        *position = position.clamp(0.0, MOCK_STROKE_STEPS);
    }
    Ok(())
}

fn program_value(program: &str, key: char) -> Result<f64, String> {
    let start = program.find(key).ok_or(format!("missing {key}"))? + 1;
    let digits: String = program[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits
        .parse::<f64>()
        .map_err(|e| format!("bad {key} value: {e}"))
}

/// Transport end of a [`MockPump`].
pub struct MockTransport {
    pump: MockPump,
    port_name: String,
    read_timeout: Duration,
    pending: Vec<u8>,
}

impl MockTransport {
    /// Open a transport on `pump` directly, bypassing the connector.
    pub fn new(pump: MockPump, port_name: &str, read_timeout: Duration) -> Self {
        pump.lock().open = true;
        Self {
            pump,
            port_name: port_name.to_string(),
            read_timeout,
            pending: Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, bytes: &[u8]) -> PumpResult<()> {
        self.pending.extend_from_slice(bytes);
        let mut state = self.pump.lock();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\r') {
            let frame: Vec<u8> = self.pending.drain(..=end).collect();
            MockPump::handle_frame(&mut state, &String::from_utf8_lossy(&frame));
        }
        Ok(())
    }

    async fn read_until(&mut self, terminator: u8) -> PumpResult<Vec<u8>> {
        let mut state = self.pump.lock();
        let mut frame = Vec::new();
        while let Some(byte) = state.outbox.pop_front() {
            frame.push(byte);
            if byte == terminator {
                return Ok(frame);
            }
        }
        // Nothing more will ever arrive, so the real port would time out here.
        Err(PumpError::Timeout(self.read_timeout))
    }

    async fn close(&mut self) -> PumpResult<()> {
        let mut state = self.pump.lock();
        state.open = false;
        state.outbox.clear();
        Ok(())
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }
}

/// Connector that hands out transports on a shared [`MockPump`].
#[derive(Clone, Debug, Default)]
pub struct MockConnector {
    pump: MockPump,
}

impl MockConnector {
    /// Connect to `pump`.
    pub fn new(pump: MockPump) -> Self {
        Self { pump }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, port: &str, settings: &SerialSettings) -> PumpResult<Box<dyn Transport>> {
        if self.pump.lock().fail_open {
            return Err(PumpError::Connection {
                port: port.to_string(),
                reason: "No such device".to_string(),
            });
        }
        Ok(Box::new(MockTransport::new(
            self.pump.clone(),
            port,
            settings.read_timeout,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(pump: &MockPump) -> MockTransport {
        MockTransport::new(pump.clone(), "sim", Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_replies_with_echo_and_data_frame() {
        let pump = MockPump::new();
        pump.set_positions(250.0, 0.0);
        let mut link = transport(&pump);

        link.write(b"aBYQP\r").await.unwrap();
        assert_eq!(link.read_until(b'\r').await.unwrap(), b"aBYQP\r");
        assert_eq!(link.read_until(b'\r').await.unwrap(), b"`250\r");
    }

    #[tokio::test]
    async fn test_move_updates_positions_and_busy() {
        let pump = MockPump::new().with_busy_polls(2);
        let mut link = transport(&pump);

        link.write(b"aBIP400S30N5OCIP400S30N5OR\r").await.unwrap();
        assert_eq!(pump.positions(), (400.0, 400.0));

        let mut statuses = Vec::new();
        for _ in 0..3 {
            link.read_until(b'\r').await.ok();
            link.read_until(b'\r').await.ok();
            link.write(b"aF\r").await.unwrap();
            link.read_until(b'\r').await.unwrap();
            statuses.push(link.read_until(b'\r').await.unwrap()[1]);
        }
        assert_eq!(statuses, vec![b'*', b'*', b'Y']);

        link.write(b"aBOM0S12N0OR\r").await.unwrap();
        assert_eq!(pump.positions(), (0.0, 400.0));
    }

    #[tokio::test]
    async fn test_silent_pump_times_out() {
        let pump = MockPump::new();
        pump.go_silent(true);
        let mut link = transport(&pump);

        link.write(b"aF\r").await.unwrap();
        assert!(matches!(
            link.read_until(b'\r').await,
            Err(PumpError::Timeout(_))
        ));
        assert_eq!(pump.written_frames(), vec!["aF\r".to_string()]);
    }

    #[tokio::test]
    async fn test_connector_can_fail_open() {
        let pump = MockPump::new();
        pump.fail_open(true);
        let connector = MockConnector::new(pump.clone());
        let result = connector.open("sim", &SerialSettings::default()).await;
        assert!(matches!(result, Err(PumpError::Connection { .. })));
        assert!(!pump.is_open());
    }
}
