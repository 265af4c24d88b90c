//! Pump command protocol
//!
//! Frame format: ASCII, terminated by `\r`. After the one-off address
//! assignment (`1a`), every command is addressed to device `a`, optionally
//! followed by a sub-address for one syringe:
//!
//! | Sub-address | Logical syringe |
//! |-------------|-----------------|
//! | `B`         | A               |
//! | `C`         | B               |
//!
//! Every command is answered with an echo frame and a data frame, except the
//! firmware query which returns a single frame. Payloads start at byte offset 1
//! of the data frame.
//!
//! Move commands chain one sub-command per syringe, each closed by `O`, and end
//! with `R` (run): `aBIP400S30N5OCIP400S30N5OR\r`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PumpError, PumpResult};

/// Frame terminator for both directions.
pub const TERMINATOR: u8 = b'\r';

/// Shortest stroke duration the device accepts, in seconds per full stroke.
pub const MIN_SECONDS_PER_STROKE: u32 = 1;

/// Longest stroke duration the device accepts, in seconds per full stroke.
pub const MAX_SECONDS_PER_STROKE: u32 = 250;

/// Ramp code for regular aspirate motion.
const MOTION_SLOPE: u8 = 5;

/// Ramp code for dumping to waste.
const WASTE_SLOPE: u8 = 0;

/// Logical syringe selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Syringe A only
    A,
    /// Syringe B only
    B,
    /// Both syringes, driven by one combined frame
    #[serde(rename = "A+B")]
    Both,
}

impl Channel {
    /// Physical sub-addresses this selector drives, in frame order.
    pub fn sub_addresses(self) -> &'static [SubAddress] {
        match self {
            Channel::A => &[SubAddress::B],
            Channel::B => &[SubAddress::C],
            Channel::Both => &[SubAddress::B, SubAddress::C],
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::A => write!(f, "A"),
            Channel::B => write!(f, "B"),
            Channel::Both => write!(f, "A+B"),
        }
    }
}

impl FromStr for Channel {
    type Err = PumpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Channel::A),
            "B" => Ok(Channel::B),
            "A+B" | "AB" | "BOTH" => Ok(Channel::Both),
            other => Err(PumpError::InvalidParameter(format!(
                "unknown channel '{other}' (expected A, B or A+B)"
            ))),
        }
    }
}

/// Physical syringe address on the device bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubAddress {
    /// First syringe (logical A)
    B,
    /// Second syringe (logical B)
    C,
}

impl SubAddress {
    fn as_char(self) -> char {
        match self {
            SubAddress::B => 'B',
            SubAddress::C => 'C',
        }
    }
}

/// Plunger direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Draw liquid into the syringe
    Aspirate,
    /// Push liquid out of the syringe
    Dispense,
}

impl Direction {
    fn op_char(self) -> char {
        match self {
            Direction::Aspirate => 'I',
            Direction::Dispense => 'O',
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Aspirate => write!(f, "aspirate"),
            Direction::Dispense => write!(f, "dispense"),
        }
    }
}

/// Motion parameters of one sub-command.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StrokeProgram {
    /// Relative move of `steps` at `seconds_per_stroke`.
    Motion {
        /// Steps to travel; truncated to an integer on the wire
        steps: f64,
        /// Seconds per full stroke
        seconds_per_stroke: u32,
    },
    /// Absolute move back to step zero, emptying the syringe.
    ToWaste {
        /// Seconds per full stroke
        seconds_per_stroke: u32,
    },
}

impl StrokeProgram {
    fn encode(&self) -> String {
        match *self {
            StrokeProgram::Motion {
                steps,
                seconds_per_stroke,
            } => format!("P{}S{}N{}", steps.trunc() as u64, seconds_per_stroke, MOTION_SLOPE),
            StrokeProgram::ToWaste { seconds_per_stroke } => {
                format!("M0S{}N{}", seconds_per_stroke, WASTE_SLOPE)
            }
        }
    }
}

/// Configuration register read by [`Command::QueryConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigRegister {
    /// `aH` register
    H,
    /// `aJ` register
    J,
}

/// Every command the driver sends.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Claim the bus address (`1a`).
    AssignAddress,
    /// Reset the instrument (`aXR`).
    Initialise,
    /// Absolute plunger position of one syringe (`a<sub>YQP`).
    QueryPosition(SubAddress),
    /// Busy/queue status (`aF`).
    QueryStatus,
    /// Halt the running command (`aK`).
    Kill,
    /// Drop queued commands (`aV`).
    ClearQueue,
    /// Firmware version (`aU`).
    FirmwareVersion,
    /// Configuration character (`aH`, `aJ`).
    QueryConfig(ConfigRegister),
    /// Plunger motion on one or both syringes.
    Move {
        /// Syringes to drive
        channel: Channel,
        /// Plunger direction
        direction: Direction,
        /// Shared program for every addressed syringe
        program: StrokeProgram,
    },
}

impl Command {
    /// Render the command as a terminated ASCII frame.
    pub fn encode(&self) -> String {
        let body = match self {
            Command::AssignAddress => "1a".to_string(),
            Command::Initialise => "aXR".to_string(),
            Command::QueryPosition(sub) => format!("a{}YQP", sub.as_char()),
            Command::QueryStatus => "aF".to_string(),
            Command::Kill => "aK".to_string(),
            Command::ClearQueue => "aV".to_string(),
            Command::FirmwareVersion => "aU".to_string(),
            Command::QueryConfig(ConfigRegister::H) => "aH".to_string(),
            Command::QueryConfig(ConfigRegister::J) => "aJ".to_string(),
            Command::Move {
                channel,
                direction,
                program,
            } => {
                let program = program.encode();
                let mut frame = String::from("a");
                for sub in channel.sub_addresses() {
                    frame.push(sub.as_char());
                    frame.push(direction.op_char());
                    frame.push_str(&program);
                    frame.push('O');
                }
                frame.push('R');
                frame
            }
        };
        format!("{}{}", body, TERMINATOR as char)
    }

    /// Number of reply frames the device sends for this command.
    pub fn reply_frames(&self) -> usize {
        match self {
            Command::FirmwareVersion => 1,
            _ => 2,
        }
    }
}

/// Device status decoded from the status query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceStatus {
    /// `*`: executing a command
    Busy,
    /// `Y`: idle, command queue empty
    Idle,
    /// `N`: idle, but queued commands remain
    IdleQueued,
}

fn payload(frame: &[u8]) -> PumpResult<&[u8]> {
    let end = frame
        .iter()
        .position(|b| *b == TERMINATOR)
        .unwrap_or(frame.len());
    if end < 2 {
        return Err(PumpError::Protocol(format!(
            "reply frame too short: {:?}",
            String::from_utf8_lossy(frame)
        )));
    }
    Ok(&frame[1..end])
}

/// Parse the data frame of a status query.
pub fn parse_status(frame: &[u8]) -> PumpResult<DeviceStatus> {
    let status = payload(frame)?[0];
    match status {
        b'*' => Ok(DeviceStatus::Busy),
        b'Y' => Ok(DeviceStatus::Idle),
        b'N' => Ok(DeviceStatus::IdleQueued),
        other => Err(PumpError::Protocol(format!(
            "unrecognized status character {:?}",
            other as char
        ))),
    }
}

/// Parse the data frame of a position query into a step count.
pub fn parse_position(frame: &[u8]) -> PumpResult<f64> {
    let text = std::str::from_utf8(payload(frame)?)
        .map_err(|e| PumpError::Protocol(format!("position reply is not ASCII: {e}")))?
        .trim();
    text.parse::<f64>()
        .map_err(|_| PumpError::Protocol(format!("position reply is not a number: {text:?}")))
}

/// Parse the single configuration character of a configuration query.
pub fn parse_config(frame: &[u8]) -> PumpResult<char> {
    Ok(payload(frame)?[0] as char)
}

/// Parse the firmware version frame.
pub fn parse_firmware(frame: &[u8]) -> PumpResult<String> {
    Ok(String::from_utf8_lossy(payload(frame)?).trim().to_string())
}

/// Convert a flow rate to the device's seconds-per-full-stroke speed setting.
///
/// `round(syringe_volume_ul / (rate_ul_per_min / 60))`, ties to even.
///
/// # Errors
/// [`PumpError::RateOutOfRange`] if the result is outside 1-250 s, including
/// non-positive or non-finite rates.
pub fn seconds_per_full_stroke(syringe_volume_ul: f64, rate_ul_per_min: f64) -> PumpResult<u32> {
    let seconds = (syringe_volume_ul / (rate_ul_per_min / 60.0)).round_ties_even();
    let valid = f64::from(MIN_SECONDS_PER_STROKE)..=f64::from(MAX_SECONDS_PER_STROKE);
    if !seconds.is_finite() || !valid.contains(&seconds) {
        return Err(PumpError::RateOutOfRange {
            rate_ul_per_min,
            seconds_per_stroke: seconds,
        });
    }
    Ok(seconds as u32)
}

/// Flow rate in uL/min that a stroke duration corresponds to.
pub fn flow_rate_for(syringe_volume_ul: f64, seconds_per_stroke: u32) -> f64 {
    syringe_volume_ul * 60.0 / f64::from(seconds_per_stroke)
}
