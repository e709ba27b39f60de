//! Zones Core - level tracking and zone lifecycle for the levels-and-zones stage
//!
//! - Tracked levels and their gain / loss / retest classification
//! - Zones (mth, origin, consolidation) and completion rules
//! - Stop-tracking policy
//! - Level achievement and zone completion engines
//! - Snapshot log of per-bar mutations

pub mod level;
pub mod zone;
pub mod policy;
pub mod achievement;
pub mod completion;
pub mod snapshot;

pub use level::{BlockName, Crossing, Level, RetestSide, TrackingList};
pub use zone::{BrokenLevel, Completion, ConsolidationState, Zone, ZoneChange, ZoneKind, ZoneType};
pub use policy::{ThresholdPolicy, Thresholds, TrackingPolicy};
pub use achievement::{AchievementReport, LevelAchievementEngine, LevelEvent};
pub use completion::ZoneCompletionEngine;
pub use snapshot::{SnapshotLogger, StateSnapshot};
