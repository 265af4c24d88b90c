//! Dual-syringe pump driver.
//!
//! Layering, bottom up:
//! - [`protocol`]: command encoding and reply decoding
//! - [`link`]: serialized request/reply exchanges over a transport
//! - [`position`]: absolute plunger position queries
//! - [`planner`]: pure volume-to-stroke planning
//! - [`state`]: published session state
//! - [`session`]: the command-and-control state machine

pub mod link;
pub mod planner;
pub mod position;
pub mod protocol;
pub mod session;
pub mod state;

pub use planner::{split_volume, StrokePlan, StrokeSplit, StrokeTiming, SyringeGeometry};
pub use position::{AbsolutePosition, PositionTracker};
pub use protocol::{Channel, Command, DeviceStatus, Direction, StrokeProgram};
pub use session::{DeviceConfiguration, PumpSession, SessionOptions, StrokeOutcome};
pub use state::{ConnectionState, OperationProgress, PumpReport, PumpSnapshot, PumpState};
