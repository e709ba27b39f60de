//! Zones and their completion lifecycle
//!
//! The three kinds share one base record. Kind-specific data hangs off the
//! [`ZoneKind`] tag, and [`Zone::evaluate`] dispatches on it so every
//! transition rule sits in one match.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::level::{BlockName, Level};
use crate::types::Direction;

/// Bare zone kind, as it appears in zone ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneType {
    Mth,
    Origin,
    Consolidation,
}

impl fmt::Display for ZoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneType::Mth => write!(f, "mth"),
            ZoneType::Origin => write!(f, "origin"),
            ZoneType::Consolidation => write!(f, "consolidation"),
        }
    }
}

impl FromStr for ZoneType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mth" => Ok(ZoneType::Mth),
            "origin" => Ok(ZoneType::Origin),
            "consolidation" => Ok(ZoneType::Consolidation),
            other => Err(format!("unknown zone type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completion {
    /// mth/origin not yet completed; consolidation still forming
    Incomplete,
    /// Consolidation range established, waiting for a breakout
    Confirmed,
    Complete,
    /// Consolidation after its breakout
    Broken,
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Incomplete => write!(f, "incomplete"),
            Completion::Confirmed => write!(f, "confirmed"),
            Completion::Complete => write!(f, "complete"),
            Completion::Broken => write!(f, "broken"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokenLevel {
    Support,
    Resistance,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationState {
    #[serde(default)]
    pub broken_level: Option<BrokenLevel>,
    #[serde(default)]
    pub level_lost: bool,
    #[serde(default)]
    pub level_lost_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ZoneKind {
    Mth,
    Origin,
    Consolidation(ConsolidationState),
}

/// Lifecycle change decided by [`Zone::evaluate`]
#[derive(Debug, Clone, PartialEq)]
pub enum ZoneChange {
    /// mth/origin boundary opposite the zone's bias was lost
    Completed { lost: BlockName },
    /// Consolidation broke out through one of its boundaries
    Breakout {
        broken_level: BrokenLevel,
        direction: Direction,
        at: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    /// `{symbol}:{timeframe}:{type}:{time}`
    pub id: String,
    pub symbol: String,
    pub timeframe: String,
    pub direction: Direction,
    pub completion: Completion,
    pub time: i64,
    pub block_zero: f64,
    pub block_zero_id: String,
    pub block_one: f64,
    pub block_one_id: String,
    #[serde(default)]
    pub block_half: Option<f64>,
    #[serde(default)]
    pub block_half_id: Option<String>,
    #[serde(default)]
    pub move_id: String,
    #[serde(default)]
    pub mth_value: f64,
    #[serde(default)]
    pub og_mth_value: f64,
    #[serde(default)]
    pub age_bars: u32,
    #[serde(default)]
    pub touches: u32,
    #[serde(default)]
    pub last_touch_bars_ago: u32,
    #[serde(default)]
    pub distance_from_price: f64,
    #[serde(default)]
    pub mtf_alignments: u32,
    #[serde(flatten)]
    pub kind: ZoneKind,
}

impl Zone {
    /// Zone with block ids derived from its own id
    pub fn new(
        symbol: &str,
        timeframe: &str,
        kind: ZoneKind,
        direction: Direction,
        time: i64,
        block_zero: f64,
        block_one: f64,
    ) -> Self {
        let zone_type = match &kind {
            ZoneKind::Mth => ZoneType::Mth,
            ZoneKind::Origin => ZoneType::Origin,
            ZoneKind::Consolidation(_) => ZoneType::Consolidation,
        };
        let id = format!("{}:{}:{}:{}", symbol, timeframe, zone_type, time);
        Self {
            block_zero_id: Level::make_id(&id, BlockName::BlockZero),
            block_one_id: Level::make_id(&id, BlockName::BlockOne),
            id,
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            direction,
            completion: Completion::Incomplete,
            time,
            block_zero,
            block_one,
            block_half: None,
            block_half_id: None,
            move_id: String::new(),
            mth_value: 0.0,
            og_mth_value: 0.0,
            age_bars: 0,
            touches: 0,
            last_touch_bars_ago: 0,
            distance_from_price: 0.0,
            mtf_alignments: 0,
            kind,
        }
    }

    pub fn with_block_half(mut self, value: f64) -> Self {
        self.block_half = Some(value);
        self.block_half_id = Some(Level::make_id(&self.id, BlockName::BlockHalf));
        self
    }

    pub fn zone_type(&self) -> ZoneType {
        match self.kind {
            ZoneKind::Mth => ZoneType::Mth,
            ZoneKind::Origin => ZoneType::Origin,
            ZoneKind::Consolidation(_) => ZoneType::Consolidation,
        }
    }

    /// Ids of every level this zone owns
    pub fn level_ids(&self) -> Vec<String> {
        let mut ids = vec![self.block_zero_id.clone(), self.block_one_id.clone()];
        if let Some(half) = &self.block_half_id {
            ids.push(half.clone());
        }
        ids
    }

    /// Decide the lifecycle change caused by the blocks `lost` this bar.
    ///
    /// Pure: the zone is only inspected. `None` means the zone stays as is.
    pub fn evaluate(&self, lost: &[BlockName], bar_time: i64) -> Option<ZoneChange> {
        match &self.kind {
            ZoneKind::Mth | ZoneKind::Origin => {
                if self.completion == Completion::Complete {
                    return None;
                }
                // Block values are swapped for origins, so the same block name
                // is the boundary opposite the bias for both kinds.
                let boundary = match self.direction {
                    Direction::Bullish => BlockName::BlockOne,
                    Direction::Bearish => BlockName::BlockZero,
                };
                lost.contains(&boundary)
                    .then_some(ZoneChange::Completed { lost: boundary })
            }
            ZoneKind::Consolidation(state) => {
                if self.completion != Completion::Confirmed || state.level_lost {
                    return None;
                }
                if lost.contains(&BlockName::BlockZero) {
                    Some(ZoneChange::Breakout {
                        broken_level: BrokenLevel::Support,
                        direction: Direction::Bearish,
                        at: bar_time,
                    })
                } else if lost.contains(&BlockName::BlockOne) {
                    Some(ZoneChange::Breakout {
                        broken_level: BrokenLevel::Resistance,
                        direction: Direction::Bullish,
                        at: bar_time,
                    })
                } else {
                    None
                }
            }
        }
    }

    pub fn apply(&mut self, change: &ZoneChange) {
        match change {
            ZoneChange::Completed { .. } => {
                self.completion = Completion::Complete;
            }
            ZoneChange::Breakout {
                broken_level,
                direction,
                at,
            } => {
                self.direction = *direction;
                self.completion = Completion::Broken;
                if let ZoneKind::Consolidation(state) = &mut self.kind {
                    state.broken_level = Some(*broken_level);
                    state.level_lost = true;
                    state.level_lost_time = Some(*at);
                }
            }
        }
    }
}
