//! Published pump state.
//!
//! The session is the only writer. Observers get consistent copies through
//! [`PumpSnapshot`], distributed over a `tokio::sync::watch` channel.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::protocol::{Channel, DeviceStatus, Direction};

/// Serial link state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// No transport open
    #[default]
    Disconnected,
    /// Transport open and address assigned
    Connected,
}

/// Device activity as last observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum PumpState {
    /// Not yet seen idle since connecting
    #[default]
    Uninitialised,
    /// Idle with an empty command queue
    Ready,
    /// Executing, or idle with queued work
    Busy,
}

impl PumpState {
    /// Map a decoded status character onto the session state.
    pub fn from_status(status: DeviceStatus) -> Self {
        match status {
            DeviceStatus::Busy => PumpState::Busy,
            DeviceStatus::Idle => PumpState::Ready,
            // Idle, but queued work will start on its own
            DeviceStatus::IdleQueued => PumpState::Busy,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

impl fmt::Display for PumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpState::Uninitialised => write!(f, "Uninitialised"),
            PumpState::Ready => write!(f, "Ready"),
            PumpState::Busy => write!(f, "Busy"),
        }
    }
}

/// Progress of the current (or most recent) pump/dispense call.
///
/// Frozen at its last values once the call returns.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OperationProgress {
    /// Syringes being driven
    pub channel: Channel,
    /// Direction of the stroke in flight
    pub direction: Direction,
    /// Volume of the stroke in flight, uL
    pub stroke_volume_ul: f64,
    /// Flow rate of the stroke in flight, uL/min
    pub flow_rate_ul_per_min: f64,
    /// Volume aspirated by completed strokes, uL
    pub pumped_volume_ul: f64,
    /// Volume requested by the call, uL
    pub total_volume_ul: f64,
    /// When the stroke in flight was issued
    pub started_at: DateTime<Utc>,
    /// Expected duration of the stroke in flight, seconds
    pub estimated_duration_sec: f64,
}

impl OperationProgress {
    /// Fraction of the requested volume already pumped, 0.0 to 1.0.
    pub fn fraction_complete(&self) -> f64 {
        if self.total_volume_ul <= 0.0 {
            return 0.0;
        }
        (self.pumped_volume_ul / self.total_volume_ul).clamp(0.0, 1.0)
    }
}

/// Point-in-time copy of everything the session publishes.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PumpSnapshot {
    /// Link state
    pub connection: ConnectionState,
    /// Device state
    pub pump: PumpState,
    /// Latest progress, if any operation has run
    pub progress: Option<OperationProgress>,
    /// A stop has been requested and not yet unwound
    pub stop_requested: bool,
}

impl fmt::Display for PumpSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.connection {
            ConnectionState::Disconnected => write!(f, "{}", self.connection),
            ConnectionState::Connected => write!(f, "{}, {}", self.connection, self.pump),
        }
    }
}

/// Outcome of a completed `pump` call.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PumpReport {
    /// Strokes that ran to completion
    pub strokes_completed: usize,
    /// Strokes the plan contained
    pub strokes_planned: usize,
    /// Volume aspirated, uL
    pub pumped_volume_ul: f64,
    /// Volume requested, uL
    pub requested_volume_ul: f64,
    /// Remaining strokes were abandoned because of a stop request
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_ignores_prior_state() {
        assert_eq!(PumpState::from_status(DeviceStatus::Busy), PumpState::Busy);
        assert_eq!(PumpState::from_status(DeviceStatus::Idle), PumpState::Ready);
        assert_eq!(PumpState::from_status(DeviceStatus::IdleQueued), PumpState::Busy);
    }

    #[test]
    fn test_snapshot_display() {
        let mut snapshot = PumpSnapshot::default();
        assert_eq!(snapshot.to_string(), "Disconnected");
        snapshot.connection = ConnectionState::Connected;
        snapshot.pump = PumpState::Ready;
        assert_eq!(snapshot.to_string(), "Connected, Ready");
    }
}
