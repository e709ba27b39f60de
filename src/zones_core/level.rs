//! Tracked price levels
//!
//! A level is one boundary of a zone (`block_zero`, `block_one` or
//! `block_half`). It sits in exactly one tracking list at a time and flips
//! between them as the market gains and loses it.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::zone::ZoneType;
use crate::types::{Bar, Direction};

/// Named boundary of a zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockName {
    BlockZero,
    BlockOne,
    BlockHalf,
}

impl BlockName {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockName::BlockZero => "block_zero",
            BlockName::BlockOne => "block_one",
            BlockName::BlockHalf => "block_half",
        }
    }
}

impl fmt::Display for BlockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tracking index a level currently lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingList {
    AwaitingGain,
    AwaitingLoss,
}

impl TrackingList {
    pub fn opposite(self) -> Self {
        match self {
            TrackingList::AwaitingGain => TrackingList::AwaitingLoss,
            TrackingList::AwaitingLoss => TrackingList::AwaitingGain,
        }
    }
}

impl fmt::Display for TrackingList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackingList::AwaitingGain => write!(f, "awaiting_gain"),
            TrackingList::AwaitingLoss => write!(f, "awaiting_loss"),
        }
    }
}

/// Side the bar came from when it touched a level without confirming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetestSide {
    FromBelow,
    FromAbove,
}

/// How a bar interacted with a level inside its [low, high] range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossing {
    Gain,
    Loss,
    Retest(RetestSide),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    /// `{zone_id}:{block_name}`
    pub id: String,
    pub zone_id: String,
    pub name: BlockName,
    /// Bullish: closing above `value` is a gain. Bearish: closing below is.
    pub direction: Direction,
    pub value: f64,
    #[serde(default)]
    pub gains: u32,
    #[serde(default)]
    pub conseq_gain: u32,
    #[serde(default)]
    pub last_gain_time: Option<i64>,
    #[serde(default)]
    pub losses: u32,
    #[serde(default)]
    pub conseq_loss: u32,
    #[serde(default)]
    pub last_loss_time: Option<i64>,
    #[serde(default)]
    pub bl_tests: u32,
    #[serde(default)]
    pub last_bl_test_time: Option<i64>,
    #[serde(default)]
    pub br_tests: u32,
    #[serde(default)]
    pub last_br_test_time: Option<i64>,
    #[serde(default)]
    pub tested: bool,
    pub state: TrackingList,
}

impl Level {
    /// Fresh level awaiting its first gain
    pub fn new(zone_id: &str, name: BlockName, direction: Direction, value: f64) -> Self {
        Self {
            id: Self::make_id(zone_id, name),
            zone_id: zone_id.to_string(),
            name,
            direction,
            value,
            gains: 0,
            conseq_gain: 0,
            last_gain_time: None,
            losses: 0,
            conseq_loss: 0,
            last_loss_time: None,
            bl_tests: 0,
            last_bl_test_time: None,
            br_tests: 0,
            last_br_test_time: None,
            tested: false,
            state: TrackingList::AwaitingGain,
        }
    }

    pub fn make_id(zone_id: &str, name: BlockName) -> String {
        format!("{}:{}", zone_id, name)
    }

    /// Kind of the owning zone, read from `{symbol}:{timeframe}:{kind}:{time}`
    pub fn zone_type(&self) -> Option<ZoneType> {
        self.zone_id.split(':').nth(2).and_then(|s| s.parse().ok())
    }

    fn is_gain_side(&self, price: f64) -> bool {
        match self.direction {
            Direction::Bullish => price > self.value,
            Direction::Bearish => price < self.value,
        }
    }

    fn is_loss_side(&self, price: f64) -> bool {
        match self.direction {
            Direction::Bullish => price < self.value,
            Direction::Bearish => price > self.value,
        }
    }

    /// Classify the bar against this level as seen from `list`.
    ///
    /// Returns `None` when the bar's range does not reach the level. A close
    /// exactly on the level never confirms.
    pub fn classify(&self, bar: &Bar, list: TrackingList) -> Option<Crossing> {
        if self.value < bar.low || self.value > bar.high {
            return None;
        }

        let confirmed = match list {
            TrackingList::AwaitingGain => self.is_gain_side(bar.close),
            TrackingList::AwaitingLoss => self.is_loss_side(bar.close),
        };

        if confirmed {
            return Some(match list {
                TrackingList::AwaitingGain => Crossing::Gain,
                TrackingList::AwaitingLoss => Crossing::Loss,
            });
        }

        let side = if bar.open < self.value {
            RetestSide::FromBelow
        } else {
            RetestSide::FromAbove
        };
        Some(Crossing::Retest(side))
    }

    pub fn record_gain(&mut self, time: i64) {
        self.gains += 1;
        self.conseq_gain += 1;
        self.conseq_loss = 0;
        self.last_gain_time = Some(time);
    }

    pub fn record_loss(&mut self, time: i64) {
        self.losses += 1;
        self.conseq_loss += 1;
        self.conseq_gain = 0;
        self.last_loss_time = Some(time);
    }

    pub fn record_retest(&mut self, side: RetestSide, time: i64) {
        match side {
            RetestSide::FromBelow => {
                self.bl_tests += 1;
                self.last_bl_test_time = Some(time);
            }
            RetestSide::FromAbove => {
                self.br_tests += 1;
                self.last_br_test_time = Some(time);
            }
        }
        self.tested = true;
    }

    /// True when the level was lost by the bar opening at `time`
    pub fn lost_at(&self, time: i64) -> bool {
        self.last_loss_time == Some(time)
    }
}
