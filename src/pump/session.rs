//! Pump session state machine.
//!
//! ```text
//! Disconnected -> Connected(Uninitialised) -> Connected(Ready) <-> Connected(Busy)
//! ```
//!
//! One session owns one device. Long-running operations (`connect`,
//! `initialise`, `pump`, `pump_single_stroke`, `dispense_to_waste`,
//! `disconnect`) exclude each other; a second one is rejected with
//! [`PumpError::OperationInProgress`] rather than queued. `stop` and
//! `poll_status` bypass that exclusion so they can run while an operation is in
//! flight. Every request/reply exchange holds the link lock, so their frames
//! never interleave.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use syringe_pump::adapters::SerialConnector;
//! use syringe_pump::pump::{Channel, PumpSession, SessionOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = Arc::new(PumpSession::new(
//!         Arc::new(SerialConnector),
//!         SessionOptions::default(),
//!     ));
//!     session.connect("/dev/ttyUSB0").await?;
//!     session.initialise().await?;
//!
//!     let report = session.pump(Channel::Both, 1200.0, 1000.0, 2500.0, 500.0).await?;
//!     println!("Pumped {} uL", report.pumped_volume_ul);
//!
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::link::PumpLink;
use super::planner::{
    estimated_duration_secs, needs_waste_dump, StrokePlan, StrokeTiming, SyringeGeometry,
};
use super::position::PositionTracker;
use super::protocol::{
    parse_config, parse_firmware, parse_status, seconds_per_full_stroke, Channel, Command,
    ConfigRegister, Direction, StrokeProgram,
};
use super::state::{
    ConnectionState, OperationProgress, PumpReport, PumpSnapshot, PumpState,
};
use crate::adapters::{Connector, SerialSettings};
use crate::config::PumpConfig;
use crate::error::{PumpError, PumpResult};

/// Session tuning. Usually built from [`PumpConfig`].
#[derive(Clone, Debug, PartialEq)]
pub struct SessionOptions {
    /// Serial line settings used by `connect`
    pub serial: SerialSettings,
    /// Default syringe geometry; `pump` overrides the volume per call
    pub geometry: SyringeGeometry,
    /// Delay between status polls while waiting for the device
    pub poll_interval: Duration,
    /// Delay between the kill and clear-queue commands of `stop`
    pub stop_settle: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&PumpConfig::default())
    }
}

impl From<&PumpConfig> for SessionOptions {
    fn from(config: &PumpConfig) -> Self {
        Self {
            serial: config.serial.settings(),
            geometry: config.syringe.geometry(),
            poll_interval: config.polling.interval(),
            stop_settle: config.polling.stop_settle(),
        }
    }
}

/// How a single stroke ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrokeOutcome {
    /// The aspirate move ran to idle with no stop requested
    Completed,
    /// The aspirate move was issued and has finished, but a stop was requested meanwhile
    CancellationRequested,
    /// A stop arrived before the aspirate move was issued
    Abandoned,
}

/// Result of waiting for the device to report idle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WaitOutcome {
    Idle,
    CancellationRequested,
}

/// Configuration characters reported by the `aH` and `aJ` queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceConfiguration {
    /// `aH` register
    pub h: char,
    /// `aJ` register
    pub j: char,
}

/// Command-and-control session for one pump.
pub struct PumpSession {
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    link: PumpLink,
    operation: Mutex<()>,
    stop_requested: AtomicBool,
    state_tx: watch::Sender<PumpSnapshot>,
}

impl PumpSession {
    /// Create a disconnected session that opens ports through `connector`.
    pub fn new(connector: Arc<dyn Connector>, options: SessionOptions) -> Self {
        let (state_tx, _) = watch::channel(PumpSnapshot::default());
        Self {
            connector,
            options,
            link: PumpLink::new(),
            operation: Mutex::new(()),
            stop_requested: AtomicBool::new(false),
            state_tx,
        }
    }

    // ------------------------------------------------------------------
    // Published state
    // ------------------------------------------------------------------

    /// Current link state.
    pub fn connection_state(&self) -> ConnectionState {
        self.state_tx.borrow().connection
    }

    /// Device state as last observed.
    pub fn pump_state(&self) -> PumpState {
        self.state_tx.borrow().pump
    }

    /// Progress of the current or most recent pump/dispense call.
    pub fn progress(&self) -> Option<OperationProgress> {
        self.state_tx.borrow().progress.clone()
    }

    /// Consistent copy of all published state.
    pub fn snapshot(&self) -> PumpSnapshot {
        self.state_tx.borrow().clone()
    }

    /// Receive every state change.
    pub fn subscribe(&self) -> watch::Receiver<PumpSnapshot> {
        self.state_tx.subscribe()
    }

    /// True while a stop is pending.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn set_pump_state(&self, state: PumpState) {
        self.state_tx.send_if_modified(|snapshot| {
            if snapshot.pump == state {
                return false;
            }
            debug!(from = %snapshot.pump, to = %state, "Pump state changed");
            snapshot.pump = state;
            true
        });
    }

    fn set_stop_flag(&self, requested: bool) {
        self.stop_requested.store(requested, Ordering::SeqCst);
        self.state_tx.send_if_modified(|snapshot| {
            let changed = snapshot.stop_requested != requested;
            snapshot.stop_requested = requested;
            changed
        });
    }

    fn start_progress(&self, channel: Channel, direction: Direction, total_volume_ul: f64) {
        self.state_tx.send_modify(|snapshot| {
            snapshot.progress = Some(OperationProgress {
                channel,
                direction,
                stroke_volume_ul: 0.0,
                flow_rate_ul_per_min: 0.0,
                pumped_volume_ul: 0.0,
                total_volume_ul,
                started_at: Utc::now(),
                estimated_duration_sec: 0.0,
            });
        });
    }

    fn begin_stroke(&self, direction: Direction, stroke_volume_ul: f64, flow_rate_ul_per_min: f64) {
        self.state_tx.send_modify(|snapshot| {
            if let Some(progress) = snapshot.progress.as_mut() {
                progress.direction = direction;
                progress.stroke_volume_ul = stroke_volume_ul;
                progress.flow_rate_ul_per_min = flow_rate_ul_per_min;
                progress.started_at = Utc::now();
                progress.estimated_duration_sec =
                    estimated_duration_secs(stroke_volume_ul, flow_rate_ul_per_min);
            }
        });
    }

    fn record_pumped(&self, pumped_volume_ul: f64) {
        self.state_tx.send_modify(|snapshot| {
            if let Some(progress) = snapshot.progress.as_mut() {
                progress.pumped_volume_ul = pumped_volume_ul;
            }
        });
    }

    // ------------------------------------------------------------------
    // Guards
    // ------------------------------------------------------------------

    fn reject<T>(&self, operation: &'static str, err: PumpError) -> PumpResult<T> {
        error!(operation, error = %err, "Command rejected");
        Err(err)
    }

    fn begin_operation(&self, operation: &'static str) -> PumpResult<MutexGuard<'_, ()>> {
        match self.operation.try_lock() {
            Ok(guard) => Ok(guard),
            Err(_) => self.reject(operation, PumpError::OperationInProgress),
        }
    }

    fn require_connected(&self, operation: &'static str) -> PumpResult<()> {
        if self.connection_state() == ConnectionState::Disconnected {
            return self.reject(operation, PumpError::NotConnected);
        }
        Ok(())
    }

    fn require_ready(&self, operation: &'static str) -> PumpResult<()> {
        self.require_connected(operation)?;
        let state = self.pump_state();
        if state != PumpState::Ready {
            return self.reject(
                operation,
                PumpError::InvalidState {
                    operation,
                    state: state.to_string(),
                },
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open `port`, claim the bus address and wait for the device to settle.
    ///
    /// # Errors
    /// [`PumpError::Connection`] if the port cannot be opened; the session then
    /// stays disconnected.
    pub async fn connect(&self, port: &str) -> PumpResult<()> {
        let _operation = self.begin_operation("connect")?;
        self.open_link(port).await?;
        self.set_pump_state(PumpState::Busy);
        self.wait_until_ready().await?;
        info!("Pump ready");
        Ok(())
    }

    /// Like [`connect`](Self::connect), but takes a single status reading
    /// instead of waiting for the device to go idle.
    ///
    /// Used to reach a device that may still be running a stroke, typically
    /// to [`stop`](Self::stop) it.
    pub async fn connect_without_wait(&self, port: &str) -> PumpResult<PumpState> {
        let _operation = self.begin_operation("connect")?;
        self.open_link(port).await?;
        self.poll_status().await
    }

    async fn open_link(&self, port: &str) -> PumpResult<()> {
        if self.connection_state() == ConnectionState::Connected {
            return self.reject(
                "connect",
                PumpError::InvalidState {
                    operation: "connect",
                    state: ConnectionState::Connected.to_string(),
                },
            );
        }

        info!(port, "Attempting to connect");
        let transport = match self.connector.open(port, &self.options.serial).await {
            Ok(transport) => transport,
            Err(err) => {
                error!(port, error = %err, "Unable to connect to device");
                return Err(err);
            }
        };
        self.link.attach(transport).await;
        self.state_tx.send_modify(|snapshot| {
            snapshot.connection = ConnectionState::Connected;
            snapshot.pump = PumpState::Uninitialised;
        });
        info!(port, "Connected");

        self.link.exchange(&Command::AssignAddress).await?;
        Ok(())
    }

    /// Reset the instrument to a known state and wait until it is ready.
    pub async fn initialise(&self) -> PumpResult<()> {
        let _operation = self.begin_operation("initialise")?;
        self.require_connected("initialise")?;

        info!("Initialising pump");
        self.link.exchange(&Command::Initialise).await?;
        self.set_pump_state(PumpState::Busy);
        self.wait_until_ready().await?;
        info!("Pump initialised");
        Ok(())
    }

    /// Close the port and return to the initial state.
    pub async fn disconnect(&self) -> PumpResult<()> {
        let _operation = self.begin_operation("disconnect")?;
        self.require_connected("disconnect")?;

        info!("Disconnecting");
        self.link.detach().await?;
        self.stop_requested.store(false, Ordering::SeqCst);
        self.state_tx.send_modify(|snapshot| {
            snapshot.connection = ConnectionState::Disconnected;
            snapshot.pump = PumpState::Uninitialised;
            snapshot.stop_requested = false;
        });
        info!("Disconnected");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// One status exchange. Does nothing while disconnected.
    ///
    /// `*` and `N` map to Busy, `Y` to Ready. Any other status character is a
    /// [`PumpError::Protocol`] and leaves the state untouched.
    pub async fn poll_status(&self) -> PumpResult<PumpState> {
        if self.connection_state() == ConnectionState::Disconnected {
            return Ok(self.pump_state());
        }

        let reply = self.link.query(&Command::QueryStatus).await?;
        let status = match parse_status(&reply) {
            Ok(status) => status,
            Err(err) => {
                warn!(error = %err, "Ignoring status reply");
                return Err(err);
            }
        };
        let state = PumpState::from_status(status);
        self.set_pump_state(state);
        Ok(state)
    }

    async fn wait_until_ready(&self) -> PumpResult<WaitOutcome> {
        loop {
            if self.poll_status().await? == PumpState::Ready {
                return Ok(if self.is_stop_requested() {
                    WaitOutcome::CancellationRequested
                } else {
                    WaitOutcome::Idle
                });
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    // ------------------------------------------------------------------
    // Motion
    // ------------------------------------------------------------------

    async fn dispatch_move(
        &self,
        channel: Channel,
        direction: Direction,
        program: StrokeProgram,
    ) -> PumpResult<()> {
        let command = Command::Move {
            channel,
            direction,
            program,
        };
        self.link.exchange(&command).await?;
        self.set_pump_state(PumpState::Busy);
        Ok(())
    }

    /// Aspirate `volume_ul`, or more, in as many strokes as the syringe needs.
    ///
    /// Before each stroke the involved syringes' positions are queried; a
    /// syringe that cannot take the stroke is first dumped to waste at the
    /// dispense rate. A stop request abandons the remaining strokes once the
    /// current one has finished.
    ///
    /// # Errors
    /// Validation errors ([`PumpError::RateOutOfRange`],
    /// [`PumpError::InvalidParameter`]) are returned before any I/O.
    pub async fn pump(
        &self,
        channel: Channel,
        volume_ul: f64,
        aspirate_rate_ul_per_min: f64,
        dispense_rate_ul_per_min: f64,
        syringe_volume_ul: f64,
    ) -> PumpResult<PumpReport> {
        let _operation = self.begin_operation("pump")?;
        self.require_ready("pump")?;

        let plan = match self.options.geometry.with_volume(syringe_volume_ul).and_then(|geometry| {
            StrokePlan::new(
                channel,
                volume_ul,
                aspirate_rate_ul_per_min,
                dispense_rate_ul_per_min,
                geometry,
            )
        }) {
            Ok(plan) => plan,
            Err(err) => return self.reject("pump", err),
        };

        info!(
            %channel,
            volume_ul,
            strokes = plan.strokes.count(),
            estimated_s = plan.estimated_duration_secs(),
            aspirate_s_per_stroke = plan.timing.aspirate_seconds,
            dispense_s_per_stroke = plan.timing.dispense_seconds,
            "Pumping"
        );
        self.start_progress(channel, Direction::Aspirate, volume_ul);

        let result = self.run_plan(&plan).await;
        self.set_stop_flag(false);

        if let Ok(report) = &result {
            info!(
                pumped_ul = report.pumped_volume_ul,
                strokes = report.strokes_completed,
                cancelled = report.cancelled,
                "Pump finished"
            );
        }
        result
    }

    async fn run_plan(&self, plan: &StrokePlan) -> PumpResult<PumpReport> {
        let mut report = PumpReport {
            strokes_completed: 0,
            strokes_planned: plan.strokes.count(),
            pumped_volume_ul: 0.0,
            requested_volume_ul: plan.total_volume_ul,
            cancelled: false,
        };

        for stroke_volume in plan.strokes.iter() {
            if self.is_stop_requested() {
                info!("Stop requested, abandoning remaining volume");
                report.cancelled = true;
                break;
            }

            let outcome = self
                .execute_stroke(plan.channel, stroke_volume, &plan.timing, &plan.geometry)
                .await?;
            if outcome == StrokeOutcome::Abandoned {
                report.cancelled = true;
                break;
            }

            report.strokes_completed += 1;
            report.pumped_volume_ul += stroke_volume;
            self.record_pumped(report.pumped_volume_ul);

            if outcome == StrokeOutcome::CancellationRequested {
                report.cancelled = report.strokes_completed < report.strokes_planned;
                if report.cancelled {
                    info!("Stop requested, abandoning remaining volume");
                }
                break;
            }
        }
        Ok(report)
    }

    /// Run exactly one stroke of at most one syringe volume, with the same
    /// overflow handling as [`pump`](Self::pump).
    ///
    /// # Errors
    /// [`PumpError::VolumeExceedsCapacity`] if `volume_ul` is larger than the
    /// syringe; nothing is written to the device in that case.
    pub async fn pump_single_stroke(
        &self,
        channel: Channel,
        volume_ul: f64,
        aspirate_rate_ul_per_min: f64,
        dispense_rate_ul_per_min: f64,
        syringe_volume_ul: f64,
    ) -> PumpResult<StrokeOutcome> {
        let _operation = self.begin_operation("pump stroke")?;
        self.require_ready("pump stroke")?;

        let validated = self
            .options
            .geometry
            .with_volume(syringe_volume_ul)
            .and_then(|geometry| {
                geometry.check_stroke(volume_ul)?;
                let timing = StrokeTiming::from_rates(
                    &geometry,
                    aspirate_rate_ul_per_min,
                    dispense_rate_ul_per_min,
                )?;
                Ok((geometry, timing))
            });
        let (geometry, timing) = match validated {
            Ok(validated) => validated,
            Err(err) => return self.reject("pump stroke", err),
        };

        self.start_progress(channel, Direction::Aspirate, volume_ul);
        let result = self.execute_stroke(channel, volume_ul, &timing, &geometry).await;
        self.set_stop_flag(false);

        if let Ok(StrokeOutcome::Completed | StrokeOutcome::CancellationRequested) = &result {
            self.record_pumped(volume_ul);
        }
        result
    }

    async fn execute_stroke(
        &self,
        channel: Channel,
        volume_ul: f64,
        timing: &StrokeTiming,
        geometry: &SyringeGeometry,
    ) -> PumpResult<StrokeOutcome> {
        let steps = geometry.steps_for(volume_ul);

        // Always ask the device; local bookkeeping drifts.
        let position = PositionTracker::new(&self.link).query_position(channel).await?;
        debug!(?position, steps, "Stroke position check");

        if needs_waste_dump(&position, steps, geometry.stroke_steps) {
            info!(%channel, "Dispensing syringe to waste");
            self.begin_stroke(
                Direction::Dispense,
                geometry.syringe_volume_ul,
                timing.dispense_rate_ul_per_min,
            );
            self.dispatch_move(
                channel,
                Direction::Dispense,
                StrokeProgram::ToWaste {
                    seconds_per_stroke: timing.dispense_seconds,
                },
            )
            .await?;
            if self.wait_until_ready().await? == WaitOutcome::CancellationRequested {
                return Ok(StrokeOutcome::Abandoned);
            }
        }

        if self.is_stop_requested() {
            return Ok(StrokeOutcome::Abandoned);
        }

        info!(%channel, volume_ul, "Aspirating");
        self.begin_stroke(
            Direction::Aspirate,
            volume_ul,
            timing.aspirate_rate_ul_per_min,
        );
        self.dispatch_move(
            channel,
            Direction::Aspirate,
            StrokeProgram::Motion {
                steps,
                seconds_per_stroke: timing.aspirate_seconds,
            },
        )
        .await?;

        Ok(match self.wait_until_ready().await? {
            WaitOutcome::Idle => StrokeOutcome::Completed,
            WaitOutcome::CancellationRequested => StrokeOutcome::CancellationRequested,
        })
    }

    /// Empty the selected syringe(s) to waste in one stroke.
    pub async fn dispense_to_waste(
        &self,
        channel: Channel,
        dispense_rate_ul_per_min: f64,
        syringe_volume_ul: f64,
    ) -> PumpResult<()> {
        let _operation = self.begin_operation("dispense to waste")?;
        self.require_ready("dispense to waste")?;

        let seconds_per_stroke = match self
            .options
            .geometry
            .with_volume(syringe_volume_ul)
            .and_then(|geometry| {
                seconds_per_full_stroke(geometry.syringe_volume_ul, dispense_rate_ul_per_min)
            }) {
            Ok(seconds) => seconds,
            Err(err) => return self.reject("dispense to waste", err),
        };

        info!(%channel, seconds_per_stroke, "Dispensing syringe to waste");
        self.start_progress(channel, Direction::Dispense, syringe_volume_ul);
        self.begin_stroke(Direction::Dispense, syringe_volume_ul, dispense_rate_ul_per_min);

        let result = async {
            self.dispatch_move(
                channel,
                Direction::Dispense,
                StrokeProgram::ToWaste { seconds_per_stroke },
            )
            .await?;
            self.wait_until_ready().await
        }
        .await;
        self.set_stop_flag(false);

        result?;
        self.record_pumped(syringe_volume_ul);
        Ok(())
    }

    /// Halt the running command and drop the device's queue.
    ///
    /// Sends kill, waits briefly so the device can act on it, then clears the
    /// queue and polls until idle. Motion already committed is not undone. An
    /// in-flight `pump` notices the request at its next poll and issues no
    /// further strokes.
    pub async fn stop(&self) -> PumpResult<()> {
        self.require_connected("stop")?;

        info!("Stopping pump! Clearing command queue.");
        self.set_stop_flag(true);
        let result = async {
            self.link.exchange(&Command::Kill).await?;
            tokio::time::sleep(self.options.stop_settle).await;
            self.link.exchange(&Command::ClearQueue).await?;
            self.wait_until_ready().await
        }
        .await;

        // Nothing in flight to unwind the request, so clear it here, even
        // when the device failed to answer.
        if let Ok(_idle) = self.operation.try_lock() {
            self.set_stop_flag(false);
        }

        match result {
            Ok(_) => {
                info!("Pump stopped");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Stop did not complete");
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Device information
    // ------------------------------------------------------------------

    /// Firmware version string.
    pub async fn firmware_version(&self) -> PumpResult<String> {
        self.require_connected("read firmware version")?;
        let reply = self.link.query(&Command::FirmwareVersion).await?;
        parse_firmware(&reply)
    }

    /// Read both configuration registers.
    pub async fn configuration(&self) -> PumpResult<DeviceConfiguration> {
        self.require_connected("read configuration")?;
        info!("Checking pump config");
        let h = parse_config(&self.link.query(&Command::QueryConfig(ConfigRegister::H)).await?)?;
        let j = parse_config(&self.link.query(&Command::QueryConfig(ConfigRegister::J)).await?)?;
        Ok(DeviceConfiguration { h, j })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockConnector, MockPump};
    use tracing_test::traced_test;

    fn session(pump: &MockPump) -> PumpSession {
        let options = SessionOptions {
            poll_interval: Duration::from_millis(1),
            stop_settle: Duration::from_millis(1),
            ..SessionOptions::default()
        };
        PumpSession::new(Arc::new(MockConnector::new(pump.clone())), options)
    }

    #[tokio::test]
    #[traced_test]
    async fn test_rejected_command_is_logged_at_error() {
        let pump = MockPump::new();
        let session = session(&pump);

        let err = session.initialise().await.unwrap_err();
        assert!(matches!(err, PumpError::NotConnected));
        assert!(logs_contain("Command rejected"));
        assert_eq!(pump.bytes_written(), 0);
    }

    #[tokio::test]
    async fn test_connect_waits_until_ready() {
        let pump = MockPump::new();
        pump.script_status(b"**");
        let session = session(&pump);

        session.connect("sim").await.unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Connected);
        assert_eq!(session.pump_state(), PumpState::Ready);

        let frames = pump.written_frames();
        assert_eq!(frames[0], "1a\r");
        assert_eq!(frames.iter().filter(|f| *f == "aF\r").count(), 3);
    }

    #[tokio::test]
    async fn test_second_operation_is_rejected_while_one_is_in_flight() {
        let pump = MockPump::new();
        let session = session(&pump);
        session.connect("sim").await.unwrap();

        let _held = session.begin_operation("test").unwrap();
        assert!(matches!(
            session.initialise().await,
            Err(PumpError::OperationInProgress)
        ));
    }

    #[tokio::test]
    async fn test_device_information() {
        let pump = MockPump::new();
        let session = session(&pump);
        session.connect("sim").await.unwrap();

        assert_eq!(
            session.firmware_version().await.unwrap(),
            crate::adapters::mock_adapter::MOCK_FIRMWARE
        );
        let config = session.configuration().await.unwrap();
        assert_eq!(config, DeviceConfiguration { h: '1', j: '0' });
        // Frame cursor stays aligned after the single-frame firmware reply
        assert_eq!(session.poll_status().await.unwrap(), PumpState::Ready);
    }
}
