//! Command-and-control driver for a dual-channel syringe pump.
//!
//! The pump is driven over a serial line with a terse ASCII protocol. This
//! library opens the link, tracks the device state, converts volumes and flow
//! rates into plunger strokes, and splits large requests into several strokes
//! with automatic dumps to waste. It is used by the `syringe-pump` binary and
//! can be embedded in larger acquisition software.

pub mod adapters;
pub mod config;
pub mod error;
pub mod logging;
pub mod pump;

pub use error::{PumpError, PumpResult};
pub use pump::{Channel, PumpSession, SessionOptions};
