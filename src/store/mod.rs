//! Level store - the shared state every worker reads and writes
//!
//! Holds level, zone and bar records, the two tracking indices per
//! partition, the append-only snapshot log, and partition claims. All
//! mutations of one processing phase go through a single [`WriteBatch`].

mod memory;

pub use memory::{MemoryStore, TrackingIndex};

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Bar, IngestionMode, Partition};
use crate::zones_core::{Level, StateSnapshot, TrackingList, Zone};

/// Read-only view of the ingestion stage's status records
#[async_trait]
pub trait StatusReader: Send + Sync {
    /// Mode for `symbol`; a missing record reads as stopped
    async fn ingestion_mode(&self, symbol: &str) -> Result<IngestionMode>;
}

#[async_trait]
pub trait LevelStore: Send + Sync {
    /// Ids of levels in `list` whose value lies in `[low, high]`, by price
    async fn levels_in_range(
        &self,
        partition: &Partition,
        list: TrackingList,
        low: f64,
        high: f64,
    ) -> Result<Vec<String>>;

    /// Records for `ids`; unknown ids are left out
    async fn fetch_levels(&self, ids: &[String]) -> Result<Vec<Level>>;

    /// Records for `ids`; unknown ids are left out
    async fn fetch_zones(&self, ids: &[String]) -> Result<Vec<Zone>>;

    /// Apply every op of `batch` with no other writer interleaving
    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    async fn append_snapshot(&self, partition: &Partition, entry: &StateSnapshot) -> Result<()>;

    /// Fails with `PartitionConflict` when another worker holds the claim
    async fn claim_partition(&self, partition: &Partition, worker: &str) -> Result<()>;

    async fn release_partition(&self, partition: &Partition, worker: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    PutLevel(Level),
    PutZone(Zone),
    PutBar(Bar),
    /// Move a level between the tracking lists of its partition
    MoveLevel {
        partition: Partition,
        level_id: String,
        value: f64,
        from: TrackingList,
        to: TrackingList,
    },
}

/// Ordered set of writes committed together
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_level(&mut self, level: &Level) -> &mut Self {
        self.ops.push(WriteOp::PutLevel(level.clone()));
        self
    }

    pub fn put_zone(&mut self, zone: &Zone) -> &mut Self {
        self.ops.push(WriteOp::PutZone(zone.clone()));
        self
    }

    pub fn put_bar(&mut self, bar: &Bar) -> &mut Self {
        self.ops.push(WriteOp::PutBar(bar.clone()));
        self
    }

    pub fn move_level(
        &mut self,
        partition: &Partition,
        level: &Level,
        from: TrackingList,
        to: TrackingList,
    ) -> &mut Self {
        self.ops.push(WriteOp::MoveLevel {
            partition: partition.clone(),
            level_id: level.id.clone(),
            value: level.value,
            from,
            to,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}
