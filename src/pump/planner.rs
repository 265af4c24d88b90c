//! Volume-to-stroke planning.
//!
//! A request for an arbitrary volume is split into strokes no larger than the
//! syringe. Each stroke is later executed as: position query, optional dump to
//! waste when the syringe cannot take the extra volume, then the aspirate move.
//!
//! Everything here is pure; the session drives the I/O.

use serde::{Deserialize, Serialize};

use super::position::AbsolutePosition;
use super::protocol::{seconds_per_full_stroke, Channel};
use crate::error::{PumpError, PumpResult};

/// Relative remainder treated as zero when splitting a volume into strokes.
pub const REMAINDER_TOLERANCE: f64 = 1e-12;

/// Largest number of strokes a single request may need.
pub const MAX_STROKES: usize = 10_000;

/// Syringe dimensions. Constant for the duration of one operation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyringeGeometry {
    /// Steps in one full plunger stroke (device-fixed)
    pub stroke_steps: u32,
    /// Syringe capacity in uL
    pub syringe_volume_ul: f64,
}

impl Default for SyringeGeometry {
    fn default() -> Self {
        Self {
            stroke_steps: 1000,
            syringe_volume_ul: 500.0,
        }
    }
}

impl SyringeGeometry {
    /// Validated geometry.
    pub fn new(stroke_steps: u32, syringe_volume_ul: f64) -> PumpResult<Self> {
        if stroke_steps == 0 {
            return Err(PumpError::InvalidParameter(
                "stroke steps must be positive".to_string(),
            ));
        }
        if !(syringe_volume_ul.is_finite() && syringe_volume_ul > 0.0) {
            return Err(PumpError::InvalidParameter(format!(
                "syringe volume must be positive, got {syringe_volume_ul}"
            )));
        }
        Ok(Self {
            stroke_steps,
            syringe_volume_ul,
        })
    }

    /// Same stroke length with a different syringe fitted.
    pub fn with_volume(self, syringe_volume_ul: f64) -> PumpResult<Self> {
        Self::new(self.stroke_steps, syringe_volume_ul)
    }

    /// Plunger travel for `volume_ul`.
    pub fn steps_for(&self, volume_ul: f64) -> f64 {
        volume_ul * f64::from(self.stroke_steps) / self.syringe_volume_ul
    }

    /// Reject a single stroke larger than the syringe.
    pub fn check_stroke(&self, volume_ul: f64) -> PumpResult<()> {
        if volume_ul > self.syringe_volume_ul {
            return Err(PumpError::VolumeExceedsCapacity {
                volume_ul,
                capacity_ul: self.syringe_volume_ul,
            });
        }
        if !(volume_ul.is_finite() && volume_ul > 0.0) {
            return Err(PumpError::InvalidParameter(format!(
                "stroke volume must be positive, got {volume_ul}"
            )));
        }
        Ok(())
    }
}

/// Device speed settings derived from the requested flow rates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StrokeTiming {
    /// Aspirate flow rate, uL/min
    pub aspirate_rate_ul_per_min: f64,
    /// Dispense (waste) flow rate, uL/min
    pub dispense_rate_ul_per_min: f64,
    /// Aspirate seconds per full stroke
    pub aspirate_seconds: u32,
    /// Dispense seconds per full stroke
    pub dispense_seconds: u32,
}

impl StrokeTiming {
    /// Convert both rates, failing with [`PumpError::RateOutOfRange`] if either
    /// lands outside the device's 1-250 s window.
    pub fn from_rates(
        geometry: &SyringeGeometry,
        aspirate_rate_ul_per_min: f64,
        dispense_rate_ul_per_min: f64,
    ) -> PumpResult<Self> {
        Ok(Self {
            aspirate_rate_ul_per_min,
            dispense_rate_ul_per_min,
            aspirate_seconds: seconds_per_full_stroke(
                geometry.syringe_volume_ul,
                aspirate_rate_ul_per_min,
            )?,
            dispense_seconds: seconds_per_full_stroke(
                geometry.syringe_volume_ul,
                dispense_rate_ul_per_min,
            )?,
        })
    }
}

/// Full syringe strokes followed by one final stroke carrying the remainder.
///
/// Strokes are produced on demand, so the plan stays the same size whatever
/// the requested volume.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StrokeSplit {
    count: usize,
    syringe_volume_ul: f64,
    last_stroke_ul: f64,
}

impl StrokeSplit {
    /// Number of strokes.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Stroke volumes in execution order.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.count).map(move |index| {
            if index + 1 == self.count {
                self.last_stroke_ul
            } else {
                self.syringe_volume_ul
            }
        })
    }

    /// Sum of all strokes, uL.
    pub fn total_ul(&self) -> f64 {
        self.syringe_volume_ul * (self.count - 1) as f64 + self.last_stroke_ul
    }
}

/// Split `total_volume_ul` into strokes of at most one syringe volume.
///
/// The count is `ceil(total / syringe)`. A remainder within
/// [`REMAINDER_TOLERANCE`] (relative to the total) of zero counts as an exact
/// multiple, so float noise never produces an empty trailing stroke.
///
/// # Errors
/// [`PumpError::InvalidParameter`] for a non-positive or non-finite volume,
/// or one that needs more than [`MAX_STROKES`] strokes.
pub fn split_volume(total_volume_ul: f64, syringe_volume_ul: f64) -> PumpResult<StrokeSplit> {
    if !(total_volume_ul.is_finite() && total_volume_ul > 0.0) {
        return Err(PumpError::InvalidParameter(format!(
            "volume must be positive, got {total_volume_ul}"
        )));
    }
    if !(syringe_volume_ul.is_finite() && syringe_volume_ul > 0.0) {
        return Err(PumpError::InvalidParameter(format!(
            "syringe volume must be positive, got {syringe_volume_ul}"
        )));
    }

    let full = (total_volume_ul / syringe_volume_ul).floor();
    let remainder = total_volume_ul - full * syringe_volume_ul;
    let (count, last_stroke_ul) = if remainder > REMAINDER_TOLERANCE * total_volume_ul {
        (full + 1.0, remainder.min(syringe_volume_ul))
    } else {
        (full, syringe_volume_ul)
    };

    if count > MAX_STROKES as f64 {
        return Err(PumpError::InvalidParameter(format!(
            "{total_volume_ul} uL needs {count} strokes of {syringe_volume_ul} uL (limit {MAX_STROKES})"
        )));
    }

    Ok(StrokeSplit {
        count: count as usize,
        syringe_volume_ul,
        last_stroke_ul,
    })
}

/// True when moving `steps_to_move` would push any queried syringe past the
/// end of its stroke.
pub fn needs_waste_dump(position: &AbsolutePosition, steps_to_move: f64, stroke_steps: u32) -> bool {
    position
        .highest()
        .is_some_and(|fullest| fullest + steps_to_move > f64::from(stroke_steps))
}

/// Expected wall time for `volume_ul` at `rate_ul_per_min`, in seconds.
pub fn estimated_duration_secs(volume_ul: f64, rate_ul_per_min: f64) -> f64 {
    volume_ul / (rate_ul_per_min / 60.0)
}

/// Validated multi-stroke request.
#[derive(Clone, Debug, PartialEq)]
pub struct StrokePlan {
    /// Syringes to drive
    pub channel: Channel,
    /// Requested total volume, uL
    pub total_volume_ul: f64,
    /// Per-stroke volumes
    pub strokes: StrokeSplit,
    /// Speed settings shared by every stroke
    pub timing: StrokeTiming,
    /// Syringe dimensions
    pub geometry: SyringeGeometry,
}

impl StrokePlan {
    /// Validate the request and split it into strokes. Rates are checked
    /// first; no device I/O happens here.
    pub fn new(
        channel: Channel,
        total_volume_ul: f64,
        aspirate_rate_ul_per_min: f64,
        dispense_rate_ul_per_min: f64,
        geometry: SyringeGeometry,
    ) -> PumpResult<Self> {
        let timing =
            StrokeTiming::from_rates(&geometry, aspirate_rate_ul_per_min, dispense_rate_ul_per_min)?;
        let strokes = split_volume(total_volume_ul, geometry.syringe_volume_ul)?;
        Ok(Self {
            channel,
            total_volume_ul,
            strokes,
            timing,
            geometry,
        })
    }

    /// Estimated time for the whole plan, ignoring waste dumps.
    pub fn estimated_duration_secs(&self) -> f64 {
        estimated_duration_secs(self.total_volume_ul, self.timing.aspirate_rate_ul_per_min)
    }
}
