//! Stop-tracking policy
//!
//! Decides whether a level that was just gained (lost) leaves the
//! awaiting-gain (awaiting-loss) list for the opposite one. While the policy
//! says no, the level stays put and keeps counting consecutive crossings.

use serde::{Deserialize, Serialize};

use super::level::Level;
use super::zone::ZoneType;

pub trait TrackingPolicy: Send + Sync {
    /// Called after the gain has been recorded on `level`
    fn migrate_after_gain(&self, level: &Level) -> bool;
    /// Called after the loss has been recorded on `level`
    fn migrate_after_loss(&self, level: &Level) -> bool;
}

/// Consecutive crossings required before a level flips lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub gains: u32,
    pub losses: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { gains: 1, losses: 1 }
    }
}

/// Per-zone-kind thresholds on `conseq_gain` / `conseq_loss`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    pub mth: Thresholds,
    pub origin: Thresholds,
    pub consolidation: Thresholds,
}

impl ThresholdPolicy {
    /// Same thresholds for every zone kind
    pub fn uniform(thresholds: Thresholds) -> Self {
        Self {
            mth: thresholds,
            origin: thresholds,
            consolidation: thresholds,
        }
    }

    fn thresholds_for(&self, level: &Level) -> Thresholds {
        match level.zone_type() {
            Some(ZoneType::Mth) => self.mth,
            Some(ZoneType::Origin) => self.origin,
            Some(ZoneType::Consolidation) => self.consolidation,
            None => Thresholds::default(),
        }
    }
}

impl TrackingPolicy for ThresholdPolicy {
    fn migrate_after_gain(&self, level: &Level) -> bool {
        level.conseq_gain >= self.thresholds_for(level).gains.max(1)
    }

    fn migrate_after_loss(&self, level: &Level) -> bool {
        level.conseq_loss >= self.thresholds_for(level).losses.max(1)
    }
}
