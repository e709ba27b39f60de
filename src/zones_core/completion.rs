//! Zone Completion Engine
//!
//! Runs after the achievement engine on the zones whose levels were gained
//! or lost this bar. A block counts as lost this bar when its level's
//! `last_loss_time` equals the bar's open time.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::level::BlockName;
use super::zone::{Zone, ZoneChange};
use crate::error::Result;
use crate::store::{LevelStore, WriteBatch};
use crate::types::Bar;

pub struct ZoneCompletionEngine {
    store: Arc<dyn LevelStore>,
}

impl ZoneCompletionEngine {
    pub fn new(store: Arc<dyn LevelStore>) -> Self {
        Self { store }
    }

    /// Apply completion rules to `zone_ids`; returns only the zones that changed
    pub async fn update(&self, bar: &Bar, zone_ids: &[String]) -> Result<Vec<Zone>> {
        if zone_ids.is_empty() {
            return Ok(Vec::new());
        }

        let zones = self.store.fetch_zones(zone_ids).await?;
        if zones.len() < zone_ids.len() {
            warn!(
                "[{}] {} of {} affected zones not found",
                bar.partition(),
                zone_ids.len() - zones.len(),
                zone_ids.len()
            );
        }

        let level_ids: Vec<String> = zones.iter().flat_map(Zone::level_ids).collect();
        let levels = self.store.fetch_levels(&level_ids).await?;

        let mut lost_by_zone: HashMap<String, Vec<BlockName>> = HashMap::new();
        for level in levels.iter().filter(|l| l.lost_at(bar.time)) {
            lost_by_zone
                .entry(level.zone_id.clone())
                .or_default()
                .push(level.name);
        }

        let mut batch = WriteBatch::new();
        let mut modified = Vec::new();

        for mut zone in zones {
            let lost = lost_by_zone
                .get(&zone.id)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let Some(change) = zone.evaluate(lost, bar.time) else {
                continue;
            };

            zone.apply(&change);
            match &change {
                ZoneChange::Completed { lost } => info!(
                    "[{}] Zone complete | {} | {} lost",
                    bar.partition(),
                    zone.id,
                    lost
                ),
                ZoneChange::Breakout {
                    broken_level,
                    direction,
                    ..
                } => info!(
                    "[{}] Consolidation breakout | {} | {:?} broken, now {}",
                    bar.partition(),
                    zone.id,
                    broken_level,
                    direction
                ),
            }

            batch.put_zone(&zone);
            modified.push(zone);
        }

        if !batch.is_empty() {
            self.store.commit(batch).await?;
        }

        Ok(modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::Direction;
    use crate::zones_core::{
        BrokenLevel, Completion, ConsolidationState, Level, TrackingList, ZoneKind,
    };

    const T: i64 = 1700003600000;

    fn bar() -> Bar {
        Bar::new("BTCUSDT", "1h", T, 50100.0, 50600.0, 49900.0, 50550.0, 1000.0)
    }

    /// Seed `zone` and its two block levels, marking `lost` as lost at `lost_time`
    async fn seed(store: &MemoryStore, zone: &Zone, lost: Option<BlockName>, lost_time: i64) {
        for (name, value) in [
            (BlockName::BlockZero, zone.block_zero),
            (BlockName::BlockOne, zone.block_one),
        ] {
            let mut level = Level::new(&zone.id, name, zone.direction, value);
            if lost == Some(name) {
                level.record_loss(lost_time);
                level.state = TrackingList::AwaitingGain;
            }
            store.insert_level(level).await;
        }
        store.insert_zone(zone.clone()).await;
    }

    #[tokio::test]
    async fn test_empty_ids_do_no_io() {
        let store = Arc::new(MemoryStore::new());
        let engine = ZoneCompletionEngine::new(store.clone());
        assert!(engine.update(&bar(), &[]).await.unwrap().is_empty());
        assert_eq!(store.commit_count().await, 0);
    }

    #[tokio::test]
    async fn test_bullish_mth_completes_on_block_one_loss() {
        let store = Arc::new(MemoryStore::new());
        let zone = Zone::new("BTCUSDT", "1h", ZoneKind::Mth, Direction::Bullish, 1700000000000, 49500.0, 50500.0);
        seed(&store, &zone, Some(BlockName::BlockOne), T).await;

        let engine = ZoneCompletionEngine::new(store.clone());
        let modified = engine.update(&bar(), &[zone.id.clone()]).await.unwrap();

        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].completion, Completion::Complete);
        assert_eq!(store.zone(&zone.id).await.unwrap().completion, Completion::Complete);
        assert_eq!(store.commit_count().await, 1);
    }

    #[tokio::test]
    async fn test_earlier_loss_does_not_count() {
        let store = Arc::new(MemoryStore::new());
        let zone = Zone::new("BTCUSDT", "1h", ZoneKind::Mth, Direction::Bullish, 1700000000000, 49500.0, 50500.0);
        seed(&store, &zone, Some(BlockName::BlockOne), T - 3_600_000).await;

        let engine = ZoneCompletionEngine::new(store.clone());
        let modified = engine.update(&bar(), &[zone.id.clone()]).await.unwrap();

        assert!(modified.is_empty());
        assert_eq!(store.zone(&zone.id).await.unwrap().completion, Completion::Incomplete);
        assert_eq!(store.commit_count().await, 0);
    }

    #[tokio::test]
    async fn test_consolidation_breakout_persisted() {
        let store = Arc::new(MemoryStore::new());
        let mut zone = Zone::new(
            "BTCUSDT",
            "1h",
            ZoneKind::Consolidation(ConsolidationState::default()),
            Direction::Bullish,
            1700000000000,
            49500.0,
            50500.0,
        );
        zone.completion = Completion::Confirmed;
        seed(&store, &zone, Some(BlockName::BlockZero), T).await;

        let engine = ZoneCompletionEngine::new(store.clone());
        let modified = engine.update(&bar(), &[zone.id.clone()]).await.unwrap();
        assert_eq!(modified.len(), 1);

        let stored = store.zone(&zone.id).await.unwrap();
        assert_eq!(stored.completion, Completion::Broken);
        assert_eq!(stored.direction, Direction::Bearish);
        let ZoneKind::Consolidation(state) = stored.kind else {
            panic!("kind changed");
        };
        assert_eq!(state.broken_level, Some(BrokenLevel::Support));
        assert_eq!(state.level_lost_time, Some(T));
    }

    #[tokio::test]
    async fn test_only_changed_zones_returned() {
        let store = Arc::new(MemoryStore::new());
        let done = Zone::new("BTCUSDT", "1h", ZoneKind::Mth, Direction::Bearish, 1700000000000, 50500.0, 49500.0);
        let untouched = Zone::new("BTCUSDT", "1h", ZoneKind::Origin, Direction::Bullish, 1699990000000, 49000.0, 50400.0);
        seed(&store, &done, Some(BlockName::BlockZero), T).await;
        seed(&store, &untouched, Some(BlockName::BlockZero), T).await;

        let engine = ZoneCompletionEngine::new(store.clone());
        let modified = engine
            .update(&bar(), &[done.id.clone(), untouched.id.clone(), "BTCUSDT:1h:mth:0".to_string()])
            .await
            .unwrap();

        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].id, done.id);
        assert_eq!(store.zone(&untouched.id).await.unwrap().completion, Completion::Incomplete);
    }
}
