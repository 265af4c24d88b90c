//! Absolute plunger position queries.
//!
//! The device is the only source of truth for plunger position. Steps can
//! drift against any local bookkeeping, so positions are queried fresh
//! before every stroke decision and never cached.

use serde::Serialize;

use super::link::PumpLink;
use super::protocol::{parse_position, Channel, Command, SubAddress};
use crate::error::PumpResult;

/// Step positions of the syringes involved in one query.
///
/// A syringe that was not part of the query has no value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct AbsolutePosition {
    /// Logical syringe A (sub-address `B`)
    pub steps_a: Option<f64>,
    /// Logical syringe B (sub-address `C`)
    pub steps_b: Option<f64>,
}

impl AbsolutePosition {
    fn set(&mut self, sub: SubAddress, steps: f64) {
        match sub {
            SubAddress::B => self.steps_a = Some(steps),
            SubAddress::C => self.steps_b = Some(steps),
        }
    }

    /// Fullest queried syringe, in steps.
    pub fn highest(&self) -> Option<f64> {
        match (self.steps_a, self.steps_b) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Issues position queries over a [`PumpLink`].
pub struct PositionTracker<'a> {
    link: &'a PumpLink,
}

impl<'a> PositionTracker<'a> {
    /// Track positions through `link`.
    pub fn new(link: &'a PumpLink) -> Self {
        Self { link }
    }

    /// Query every syringe `channel` addresses.
    pub async fn query_position(&self, channel: Channel) -> PumpResult<AbsolutePosition> {
        let mut position = AbsolutePosition::default();
        for sub in channel.sub_addresses() {
            let reply = self.link.query(&Command::QueryPosition(*sub)).await?;
            position.set(*sub, parse_position(&reply)?);
        }
        Ok(position)
    }
}
