//! Level Achievement Engine
//!
//! For each bar:
//! 1. Range-query both tracking lists of the bar's partition with [low, high]
//! 2. Classify every candidate as gain / loss / retest
//! 3. Update counters, migrate levels the policy releases
//! 4. Commit everything as one batch
//!
//! A bar whose range reaches no tracked level costs two range queries and
//! nothing else.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::level::{Crossing, Level, TrackingList};
use super::policy::TrackingPolicy;
use crate::error::Result;
use crate::store::{LevelStore, WriteBatch};
use crate::types::Bar;

/// One classified interaction between the bar and a level
#[derive(Debug, Clone, PartialEq)]
pub struct LevelEvent {
    pub level_id: String,
    pub zone_id: String,
    pub crossing: Crossing,
    /// Level moved to the opposite tracking list
    pub migrated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AchievementReport {
    /// Distinct zones owning a gained or lost level, first-seen order
    pub affected_zone_ids: Vec<String>,
    /// Post-mutation copies of every level this bar touched
    pub modified_levels: Vec<Level>,
    pub events: Vec<LevelEvent>,
}

impl AchievementReport {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub struct LevelAchievementEngine {
    store: Arc<dyn LevelStore>,
    policy: Arc<dyn TrackingPolicy>,
}

impl LevelAchievementEngine {
    pub fn new(store: Arc<dyn LevelStore>, policy: Arc<dyn TrackingPolicy>) -> Self {
        Self { store, policy }
    }

    pub async fn process(&self, bar: &Bar) -> Result<AchievementReport> {
        let partition = bar.partition();

        let awaiting_gain = self
            .store
            .levels_in_range(&partition, TrackingList::AwaitingGain, bar.low, bar.high)
            .await?;
        let awaiting_loss = self
            .store
            .levels_in_range(&partition, TrackingList::AwaitingLoss, bar.low, bar.high)
            .await?;

        if awaiting_gain.is_empty() && awaiting_loss.is_empty() {
            return Ok(AchievementReport::default());
        }

        let mut report = AchievementReport::default();
        let mut batch = WriteBatch::new();
        let mut seen_zones = HashSet::new();
        let mut seen_levels = HashSet::new();

        for (list, ids) in [
            (TrackingList::AwaitingGain, awaiting_gain),
            (TrackingList::AwaitingLoss, awaiting_loss),
        ] {
            if ids.is_empty() {
                continue;
            }

            let levels = self.store.fetch_levels(&ids).await?;
            if levels.len() < ids.len() {
                warn!(
                    "[{}] {} of {} {} entries have no level record - skipped",
                    partition,
                    ids.len() - levels.len(),
                    ids.len(),
                    list
                );
            }

            for mut level in levels {
                if !seen_levels.insert(level.id.clone()) {
                    warn!(
                        "[{}] {} is indexed in both tracking lists - skipping its {} entry",
                        partition, level.id, list
                    );
                    continue;
                }

                let Some(crossing) = level.classify(bar, list) else {
                    continue;
                };

                let migrated = self.record(&mut level, crossing, bar.time);
                if migrated {
                    level.state = list.opposite();
                    batch.move_level(&partition, &level, list, list.opposite());
                }
                batch.put_level(&level);

                log_event(bar, &level, crossing, migrated);

                if matches!(crossing, Crossing::Gain | Crossing::Loss)
                    && seen_zones.insert(level.zone_id.clone())
                {
                    report.affected_zone_ids.push(level.zone_id.clone());
                }
                report.events.push(LevelEvent {
                    level_id: level.id.clone(),
                    zone_id: level.zone_id.clone(),
                    crossing,
                    migrated,
                });
                report.modified_levels.push(level);
            }
        }

        if batch.is_empty() {
            return Ok(report);
        }
        self.store.commit(batch).await?;

        Ok(report)
    }

    /// Apply the crossing to the level's counters; true when it should migrate
    fn record(&self, level: &mut Level, crossing: Crossing, time: i64) -> bool {
        match crossing {
            Crossing::Gain => {
                level.record_gain(time);
                self.policy.migrate_after_gain(level)
            }
            Crossing::Loss => {
                level.record_loss(time);
                self.policy.migrate_after_loss(level)
            }
            Crossing::Retest(side) => {
                level.record_retest(side, time);
                false
            }
        }
    }
}

fn log_event(bar: &Bar, level: &Level, crossing: Crossing, migrated: bool) {
    match crossing {
        Crossing::Gain => info!(
            "[{}] Level gained | {} @ {:.2} | gains={} conseq={} | now {}",
            bar.partition(),
            level.id,
            level.value,
            level.gains,
            level.conseq_gain,
            level.state
        ),
        Crossing::Loss => info!(
            "[{}] Level lost | {} @ {:.2} | losses={} conseq={} | now {}",
            bar.partition(),
            level.id,
            level.value,
            level.losses,
            level.conseq_loss,
            level.state
        ),
        Crossing::Retest(side) => debug!(
            "[{}] Level retest {:?} | {} @ {:.2} | bl={} br={}",
            bar.partition(),
            side,
            level.id,
            level.value,
            level.bl_tests,
            level.br_tests
        ),
    }
    if migrated {
        debug!("[{}] {} moved to {}", bar.partition(), level.id, level.state);
    }
}
