//! Audit trail of per-bar mutations (event-sourcing feed)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::level::Level;
use super::zone::Zone;
use crate::error::Result;
use crate::store::LevelStore;
use crate::types::Bar;

/// Post-mutation state of everything one bar touched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: Uuid,
    pub bar_id: String,
    pub recorded_at: DateTime<Utc>,
    pub zones: Vec<Zone>,
    pub levels: Vec<Level>,
}

pub struct SnapshotLogger {
    store: Arc<dyn LevelStore>,
}

impl SnapshotLogger {
    pub fn new(store: Arc<dyn LevelStore>) -> Self {
        Self { store }
    }

    /// Append one entry for `bar`. Nothing is written when both lists are empty.
    pub async fn record(&self, bar: &Bar, zones: &[Zone], levels: &[Level]) -> Result<Option<Uuid>> {
        if zones.is_empty() && levels.is_empty() {
            return Ok(None);
        }

        let entry = StateSnapshot {
            id: Uuid::new_v4(),
            bar_id: bar.id.clone(),
            recorded_at: Utc::now(),
            zones: zones.to_vec(),
            levels: levels.to_vec(),
        };
        self.store.append_snapshot(&bar.partition(), &entry).await?;

        debug!(
            "[{}] Snapshot {} | zones={} levels={}",
            bar.partition(),
            entry.id,
            zones.len(),
            levels.len()
        );
        Ok(Some(entry.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::Direction;
    use crate::zones_core::{BlockName, ZoneKind};

    fn bar() -> Bar {
        Bar::new("BTCUSDT", "1h", 1700003600000, 49850.0, 50150.0, 49800.0, 50100.0, 1200.0)
    }

    #[tokio::test]
    async fn test_empty_record_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let logger = SnapshotLogger::new(store.clone());

        let id = logger.record(&bar(), &[], &[]).await.unwrap();
        assert!(id.is_none());
        assert!(store.snapshots(&bar().partition()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_appends_entry() {
        let store = Arc::new(MemoryStore::new());
        let logger = SnapshotLogger::new(store.clone());

        let zone = Zone::new("BTCUSDT", "1h", ZoneKind::Mth, Direction::Bullish, 1700000000000, 49500.0, 50500.0);
        let level = Level::new(&zone.id, BlockName::BlockOne, Direction::Bullish, 50500.0);

        let first = logger.record(&bar(), &[zone.clone()], &[level.clone()]).await.unwrap();
        let second = logger.record(&bar(), &[], &[level]).await.unwrap();
        assert!(first.is_some());
        assert_ne!(first, second);

        let entries = store.snapshots(&bar().partition()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].bar_id, "BTCUSDT:1h:bar:1700003600000");
        assert_eq!(entries[0].zones, vec![zone]);
        assert!(entries[1].zones.is_empty());
    }
}
