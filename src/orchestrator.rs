//! Stage orchestrator - per-bar control flow
//!
//! For each bar:
//! 1. Run-mode gate (paused / stopped bars are skipped without writes)
//! 2. Level achievements
//! 3. Annotate and persist the bar
//! 4. Zone completion for the affected zones
//! 5. Snapshot of everything mutated
//! 6. Forward downstream and wait for confirmation

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::{BarSink, BarSource, NotificationSource};
use crate::config::StageConfig;
use crate::error::Result;
use crate::store::{LevelStore, StatusReader, WriteBatch};
use crate::sync::{SyncCoordinator, SyncOutcome};
use crate::types::{Bar, IngestionMode, Partition};
use crate::zones_core::{LevelAchievementEngine, SnapshotLogger, ZoneCompletionEngine};

/// Everything a worker needs, passed in explicitly
pub struct StageContext {
    pub store: Arc<dyn LevelStore>,
    pub status: Arc<dyn StatusReader>,
    pub sink: Arc<dyn BarSink>,
    pub config: StageConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BarOutcome {
    Skipped(IngestionMode),
    Confirmed,
    /// Processed and forwarded, but the downstream wait was interrupted
    Unconfirmed(SyncOutcome),
}

#[derive(Debug, Clone, Default, PartialEq)]
struct PhaseTimings {
    achievements: Duration,
    bar_write: Duration,
    zones: Duration,
    snapshot: Duration,
    forward: Duration,
    wait: Duration,
}

pub struct StageOrchestrator<N> {
    worker_id: String,
    store: Arc<dyn LevelStore>,
    status: Arc<dyn StatusReader>,
    sink: Arc<dyn BarSink>,
    achievements: LevelAchievementEngine,
    completion: ZoneCompletionEngine,
    snapshots: SnapshotLogger,
    sync: SyncCoordinator<N>,
    claimed: HashSet<Partition>,
}

impl<N: NotificationSource> StageOrchestrator<N> {
    pub fn new(ctx: StageContext, notifications: N) -> Self {
        let policy = Arc::new(ctx.config.policy.clone());
        Self {
            worker_id: ctx.config.consumer_name.clone(),
            achievements: LevelAchievementEngine::new(ctx.store.clone(), policy),
            completion: ZoneCompletionEngine::new(ctx.store.clone()),
            snapshots: SnapshotLogger::new(ctx.store.clone()),
            sync: SyncCoordinator::new(notifications, ctx.status.clone(), &ctx.config),
            store: ctx.store,
            status: ctx.status,
            sink: ctx.sink,
            claimed: HashSet::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn process_bar(&mut self, bar: Bar) -> Result<BarOutcome> {
        self.process_bar_or_cancel(bar, &mut std::future::pending()).await
    }

    /// Same as [`process_bar`](Self::process_bar), but `cancel` cuts the
    /// downstream wait short with `Unconfirmed(Cancelled)`
    pub async fn process_bar_or_cancel(
        &mut self,
        mut bar: Bar,
        cancel: &mut (impl Future<Output = ()> + Unpin),
    ) -> Result<BarOutcome> {
        let partition = bar.partition();

        let mode = self.status.ingestion_mode(&bar.symbol).await?;
        if mode.is_halted() {
            info!("[{}] Ingestion {} - skipping {}", partition, mode, bar.id);
            return Ok(BarOutcome::Skipped(mode));
        }

        self.claim(&partition).await?;

        let mut timings = PhaseTimings::default();

        let t = Instant::now();
        let report = self.achievements.process(&bar).await?;
        timings.achievements = t.elapsed();

        let t = Instant::now();
        bar.set_achievements(&report.affected_zone_ids);
        let mut batch = WriteBatch::new();
        batch.put_bar(&bar);
        self.store.commit(batch).await?;
        timings.bar_write = t.elapsed();

        let t = Instant::now();
        let zones = self
            .completion
            .update(&bar, &report.affected_zone_ids)
            .await?;
        timings.zones = t.elapsed();

        let t = Instant::now();
        self.snapshots
            .record(&bar, &zones, &report.modified_levels)
            .await?;
        timings.snapshot = t.elapsed();

        let t = Instant::now();
        self.sink.forward(&bar).await?;
        timings.forward = t.elapsed();

        let t = Instant::now();
        let outcome = self.sync.wait_for_or_cancel(&bar, cancel).await?;
        timings.wait = t.elapsed();

        debug!(
            "[{}] timing {} | achievements={:?} bar={:?} zones={:?} snapshot={:?} forward={:?} wait={:?}",
            partition,
            bar.id,
            timings.achievements,
            timings.bar_write,
            timings.zones,
            timings.snapshot,
            timings.forward,
            timings.wait
        );

        if outcome.is_confirmed() {
            info!("processed: {} | {} | {}", bar.symbol, bar.timeframe, bar.local_time());
            return Ok(BarOutcome::Confirmed);
        }

        // A reset already drained the channel
        if !matches!(outcome, SyncOutcome::Reset | SyncOutcome::Cancelled) {
            self.sync.discard_stale().await?;
        }
        Ok(BarOutcome::Unconfirmed(outcome))
    }

    async fn claim(&mut self, partition: &Partition) -> Result<()> {
        if self.claimed.contains(partition) {
            return Ok(());
        }
        self.store.claim_partition(partition, &self.worker_id).await?;
        info!("[{}] Claimed by {}", partition, self.worker_id);
        self.claimed.insert(partition.clone());
        Ok(())
    }

    /// Release every partition this worker claimed
    pub async fn close(&mut self) -> Result<()> {
        for partition in self.claimed.drain() {
            self.store.release_partition(&partition, &self.worker_id).await?;
            info!("[{}] Released by {}", partition, self.worker_id);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct RunSummary {
    pub processed: usize,
    pub confirmed: usize,
    pub skipped: usize,
    pub unconfirmed: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &BarOutcome) {
        self.processed += 1;
        match outcome {
            BarOutcome::Skipped(_) => self.skipped += 1,
            BarOutcome::Confirmed => self.confirmed += 1,
            BarOutcome::Unconfirmed(_) => self.unconfirmed += 1,
        }
    }
}

/// Pulls bars from a source and drives them through the orchestrator
pub struct Worker<S, N> {
    source: S,
    orchestrator: StageOrchestrator<N>,
}

impl<S: BarSource, N: NotificationSource> Worker<S, N> {
    pub fn new(source: S, orchestrator: StageOrchestrator<N>) -> Self {
        Self {
            source,
            orchestrator,
        }
    }

    /// Run until the source ends or `shutdown` resolves. Claims are released
    /// on the way out, also when a fatal error stops the loop.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<RunSummary> {
        tokio::pin!(shutdown);
        info!("Worker {} started", self.orchestrator.worker_id());

        let result = self.pump(&mut shutdown).await;
        let released = self.orchestrator.close().await;

        let summary = result?;
        released?;
        info!(
            "Worker {} finished | processed={} confirmed={} skipped={} unconfirmed={}",
            self.orchestrator.worker_id(),
            summary.processed,
            summary.confirmed,
            summary.skipped,
            summary.unconfirmed
        );
        Ok(summary)
    }

    async fn pump(
        &mut self,
        shutdown: &mut std::pin::Pin<&mut impl Future<Output = ()>>,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        loop {
            let delivery = tokio::select! {
                _ = shutdown.as_mut() => {
                    info!("Shutdown requested");
                    break;
                }
                next = self.source.next() => next?,
            };
            let Some(delivery) = delivery else {
                break;
            };

            let outcome = match self
                .orchestrator
                .process_bar_or_cancel(delivery.bar, shutdown)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Message {} failed, stopping: {}", delivery.message_id, e);
                    return Err(e);
                }
            };
            if let BarOutcome::Unconfirmed(reason) = &outcome {
                warn!("Message {} unconfirmed: {:?}", delivery.message_id, reason);
            }
            summary.record(&outcome);
            self.source.ack(&delivery.message_id).await?;

            if outcome == BarOutcome::Unconfirmed(SyncOutcome::Cancelled) {
                info!("Shutdown requested during downstream wait");
                break;
            }
        }

        Ok(summary)
    }
}
