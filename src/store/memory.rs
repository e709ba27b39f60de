//! In-process store backend
//!
//! Everything sits behind one tokio `RwLock`, so a committed batch is never
//! observed half-applied. Used by the replay command and by tests.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

use super::{LevelStore, StatusReader, WriteBatch, WriteOp};
use crate::error::{Result, StageError};
use crate::types::{Bar, IngestionMode, Partition};
use crate::zones_core::{Level, StateSnapshot, TrackingList, Zone};

/// Prices are indexed as fixed-point integers (6 decimal places)
const PRICE_SCALE: f64 = 1_000_000.0;

fn price_key(price: f64) -> i64 {
    (price * PRICE_SCALE).round() as i64
}

/// `{symbol}:{timeframe}:...` prefix of any record id
fn partition_of(id: &str) -> Partition {
    let mut parts = id.split(':');
    let symbol = parts.next().unwrap_or_default();
    let timeframe = parts.next().unwrap_or_default();
    Partition::new(symbol, timeframe)
}

/// Price-ordered set of level ids
#[derive(Debug, Default)]
pub struct TrackingIndex {
    by_price: BTreeSet<(i64, String)>,
    keys: HashMap<String, i64>,
}

impl TrackingIndex {
    pub fn insert(&mut self, level_id: &str, value: f64) {
        self.remove(level_id);
        let key = price_key(value);
        self.by_price.insert((key, level_id.to_string()));
        self.keys.insert(level_id.to_string(), key);
    }

    pub fn remove(&mut self, level_id: &str) -> bool {
        match self.keys.remove(level_id) {
            Some(key) => self.by_price.remove(&(key, level_id.to_string())),
            None => false,
        }
    }

    pub fn contains(&self, level_id: &str) -> bool {
        self.keys.contains_key(level_id)
    }

    /// Ids with value in `[low, high]`, lowest price first
    pub fn range(&self, low: f64, high: f64) -> Vec<String> {
        let (lo, hi) = (price_key(low), price_key(high));
        if lo > hi {
            return Vec::new();
        }
        self.by_price
            .range((lo, String::new())..)
            .take_while(|(key, _)| *key <= hi)
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    levels: HashMap<String, Level>,
    zones: HashMap<String, Zone>,
    bars: HashMap<String, Bar>,
    indices: HashMap<(Partition, TrackingList), TrackingIndex>,
    /// Serialized snapshot entries, append-only
    snapshots: HashMap<Partition, Vec<String>>,
    statuses: HashMap<String, IngestionMode>,
    claims: HashMap<Partition, String>,
    commits: usize,
}

impl Inner {
    fn index_mut(&mut self, partition: &Partition, list: TrackingList) -> &mut TrackingIndex {
        self.indices.entry((partition.clone(), list)).or_default()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a level, indexing it in the list named by its `state`
    pub async fn insert_level(&self, level: Level) {
        let partition = partition_of(&level.zone_id);
        let mut inner = self.inner.write().await;
        inner
            .index_mut(&partition, level.state.opposite())
            .remove(&level.id);
        inner
            .index_mut(&partition, level.state)
            .insert(&level.id, level.value);
        inner.levels.insert(level.id.clone(), level);
    }

    pub async fn insert_zone(&self, zone: Zone) {
        let mut inner = self.inner.write().await;
        inner.zones.insert(zone.id.clone(), zone);
    }

    pub async fn set_mode(&self, symbol: &str, mode: IngestionMode) {
        let mut inner = self.inner.write().await;
        inner.statuses.insert(symbol.to_string(), mode);
    }

    pub async fn level(&self, id: &str) -> Option<Level> {
        self.inner.read().await.levels.get(id).cloned()
    }

    pub async fn zone(&self, id: &str) -> Option<Zone> {
        self.inner.read().await.zones.get(id).cloned()
    }

    pub async fn zones(&self) -> Vec<Zone> {
        let mut zones: Vec<Zone> = self.inner.read().await.zones.values().cloned().collect();
        zones.sort_by(|a, b| a.id.cmp(&b.id));
        zones
    }

    pub async fn bar(&self, id: &str) -> Option<Bar> {
        self.inner.read().await.bars.get(id).cloned()
    }

    /// Lists currently holding `level_id` (exactly one when consistent)
    pub async fn lists_containing(&self, partition: &Partition, level_id: &str) -> Vec<TrackingList> {
        let inner = self.inner.read().await;
        [TrackingList::AwaitingGain, TrackingList::AwaitingLoss]
            .into_iter()
            .filter(|list| {
                inner
                    .indices
                    .get(&(partition.clone(), *list))
                    .is_some_and(|idx| idx.contains(level_id))
            })
            .collect()
    }

    pub async fn snapshots(&self, partition: &Partition) -> Result<Vec<StateSnapshot>> {
        let inner = self.inner.read().await;
        let Some(entries) = inner.snapshots.get(partition) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(serde_json::from_str(entry)?);
        }
        Ok(out)
    }

    /// Drop a level record but keep its index entry
    #[cfg(test)]
    pub(crate) async fn forget_level(&self, id: &str) {
        self.inner.write().await.levels.remove(id);
    }

    /// Index a level in the other tracking list as well
    #[cfg(test)]
    pub(crate) async fn index_in_both_lists(&self, level: &Level) {
        let partition = partition_of(&level.zone_id);
        self.inner
            .write()
            .await
            .index_mut(&partition, level.state.opposite())
            .insert(&level.id, level.value);
    }

    /// Number of batches committed so far
    pub async fn commit_count(&self) -> usize {
        self.inner.read().await.commits
    }

    pub async fn claim_holder(&self, partition: &Partition) -> Option<String> {
        self.inner.read().await.claims.get(partition).cloned()
    }
}

#[async_trait]
impl StatusReader for MemoryStore {
    async fn ingestion_mode(&self, symbol: &str) -> Result<IngestionMode> {
        let inner = self.inner.read().await;
        Ok(inner
            .statuses
            .get(symbol)
            .copied()
            .unwrap_or(IngestionMode::Stopped))
    }
}

#[async_trait]
impl LevelStore for MemoryStore {
    async fn levels_in_range(
        &self,
        partition: &Partition,
        list: TrackingList,
        low: f64,
        high: f64,
    ) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .indices
            .get(&(partition.clone(), list))
            .map(|idx| idx.range(low, high))
            .unwrap_or_default())
    }

    async fn fetch_levels(&self, ids: &[String]) -> Result<Vec<Level>> {
        let inner = self.inner.read().await;
        Ok(ids.iter().filter_map(|id| inner.levels.get(id).cloned()).collect())
    }

    async fn fetch_zones(&self, ids: &[String]) -> Result<Vec<Zone>> {
        let inner = self.inner.read().await;
        Ok(ids.iter().filter_map(|id| inner.zones.get(id).cloned()).collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut inner = self.inner.write().await;
        let ops = batch.into_ops();

        // Rejected batches leave nothing behind
        for op in &ops {
            if let WriteOp::MoveLevel {
                partition,
                level_id,
                from,
                ..
            } = op
            {
                let indexed = inner
                    .indices
                    .get(&(partition.clone(), *from))
                    .is_some_and(|idx| idx.contains(level_id));
                if !indexed {
                    return Err(StageError::Store(format!(
                        "cannot move {} out of {:?} on {}: not indexed there",
                        level_id, from, partition
                    )));
                }
            }
        }

        let op_count = ops.len();
        for op in ops {
            match op {
                WriteOp::PutLevel(level) => {
                    inner.levels.insert(level.id.clone(), level);
                }
                WriteOp::PutZone(zone) => {
                    inner.zones.insert(zone.id.clone(), zone);
                }
                WriteOp::PutBar(bar) => {
                    inner.bars.insert(bar.id.clone(), bar);
                }
                WriteOp::MoveLevel {
                    partition,
                    level_id,
                    value,
                    from,
                    to,
                } => {
                    inner.index_mut(&partition, from).remove(&level_id);
                    inner.index_mut(&partition, to).insert(&level_id, value);
                }
            }
        }
        inner.commits += 1;
        debug!("Committed batch of {} ops", op_count);
        Ok(())
    }

    async fn append_snapshot(&self, partition: &Partition, entry: &StateSnapshot) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        let mut inner = self.inner.write().await;
        inner.snapshots.entry(partition.clone()).or_default().push(json);
        Ok(())
    }

    async fn claim_partition(&self, partition: &Partition, worker: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.claims.get(partition) {
            Some(holder) if holder != worker => Err(StageError::PartitionConflict {
                partition: partition.to_string(),
                holder: holder.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                inner.claims.insert(partition.clone(), worker.to_string());
                Ok(())
            }
        }
    }

    async fn release_partition(&self, partition: &Partition, worker: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.claims.get(partition).is_some_and(|holder| holder == worker) {
            inner.claims.remove(partition);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use crate::zones_core::BlockName;

    const ZONE: &str = "BTCUSDT:1h:mth:1700000000000";

    fn partition() -> Partition {
        Partition::new("BTCUSDT", "1h")
    }

    #[test]
    fn test_index_range_is_inclusive_and_ordered() {
        let mut idx = TrackingIndex::default();
        idx.insert("c", 50500.0);
        idx.insert("a", 49500.0);
        idx.insert("b", 50000.0);

        assert_eq!(idx.range(49500.0, 50000.0), vec!["a", "b"]);
        assert_eq!(idx.range(49000.0, 51000.0), vec!["a", "b", "c"]);
        assert!(idx.range(50001.0, 50499.0).is_empty());
        assert!(idx.range(51000.0, 49000.0).is_empty());
    }

    #[test]
    fn test_index_reinsert_moves_price() {
        let mut idx = TrackingIndex::default();
        idx.insert("a", 100.0);
        idx.insert("a", 200.0);
        assert_eq!(idx.len(), 1);
        assert!(idx.range(90.0, 110.0).is_empty());
        assert!(idx.remove("a"));
        assert!(!idx.remove("a"));
        assert!(idx.is_empty());
    }

    #[tokio::test]
    async fn test_seeded_level_is_in_one_list() {
        let store = MemoryStore::new();
        let level = Level::new(ZONE, BlockName::BlockZero, Direction::Bullish, 49500.0);
        let id = level.id.clone();
        store.insert_level(level).await;

        assert_eq!(
            store.lists_containing(&partition(), &id).await,
            vec![TrackingList::AwaitingGain]
        );
        let ids = store
            .levels_in_range(&partition(), TrackingList::AwaitingGain, 49000.0, 50000.0)
            .await
            .unwrap();
        assert_eq!(ids, vec![id]);
    }

    #[tokio::test]
    async fn test_commit_moves_level() {
        let store = MemoryStore::new();
        let mut level = Level::new(ZONE, BlockName::BlockOne, Direction::Bullish, 50000.0);
        store.insert_level(level.clone()).await;

        level.state = TrackingList::AwaitingLoss;
        let mut batch = WriteBatch::new();
        batch
            .put_level(&level)
            .move_level(&partition(), &level, TrackingList::AwaitingGain, TrackingList::AwaitingLoss);
        store.commit(batch).await.unwrap();

        assert_eq!(store.commit_count().await, 1);
        assert_eq!(
            store.lists_containing(&partition(), &level.id).await,
            vec![TrackingList::AwaitingLoss]
        );
        assert_eq!(
            store.level(&level.id).await.unwrap().state,
            TrackingList::AwaitingLoss
        );
    }

    #[tokio::test]
    async fn test_move_of_unindexed_level_rejects_whole_batch() {
        let store = MemoryStore::new();
        let mut level = Level::new(ZONE, BlockName::BlockOne, Direction::Bullish, 50000.0);
        store.insert_level(level.clone()).await;

        level.state = TrackingList::AwaitingGain;
        let mut batch = WriteBatch::new();
        batch
            .put_level(&level)
            .move_level(&partition(), &level, TrackingList::AwaitingLoss, TrackingList::AwaitingGain);
        let err = store.commit(batch).await.unwrap_err();

        assert!(matches!(err, StageError::Store(ref msg) if msg.contains(&level.id)));
        assert_eq!(store.commit_count().await, 0);
        assert_eq!(
            store.lists_containing(&partition(), &level.id).await,
            vec![TrackingList::AwaitingGain]
        );
    }

    #[tokio::test]
    async fn test_missing_status_reads_stopped() {
        let store = MemoryStore::new();
        assert_eq!(store.ingestion_mode("BTCUSDT").await.unwrap(), IngestionMode::Stopped);
        store.set_mode("BTCUSDT", IngestionMode::Running).await;
        assert_eq!(store.ingestion_mode("BTCUSDT").await.unwrap(), IngestionMode::Running);
    }

    #[tokio::test]
    async fn test_partition_claims() {
        let store = MemoryStore::new();
        let p = partition();
        store.claim_partition(&p, "worker-a").await.unwrap();
        store.claim_partition(&p, "worker-a").await.unwrap();

        let err = store.claim_partition(&p, "worker-b").await.unwrap_err();
        assert!(matches!(err, StageError::PartitionConflict { .. }));

        store.release_partition(&p, "worker-b").await.unwrap();
        assert_eq!(store.claim_holder(&p).await.as_deref(), Some("worker-a"));

        store.release_partition(&p, "worker-a").await.unwrap();
        store.claim_partition(&p, "worker-b").await.unwrap();
    }
}
