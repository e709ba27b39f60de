//! Downstream synchronization
//!
//! After forwarding a bar the worker blocks until the final stage publishes
//! that bar's id on the notification channel. The wait ends early on the
//! reset sentinel, on a newer bar of the same partition, or when an operator
//! halts ingestion. It never exceeds the configured ceiling.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::NotificationSource;
use crate::config::StageConfig;
use crate::error::Result;
use crate::store::StatusReader;
use crate::types::{Bar, BarId, IngestionMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Downstream finished this exact bar
    Confirmed,
    /// Pipeline reset; buffered notifications were drained
    Reset,
    /// A later bar of the same partition was confirmed first
    Stale { newer: String },
    /// Ingestion was paused or stopped during the wait
    ModeInterrupted(IngestionMode),
    TimedOut,
    /// Worker shutdown was requested during the wait
    Cancelled,
}

impl SyncOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, SyncOutcome::Confirmed)
    }
}

#[derive(Debug, PartialEq)]
enum Notification {
    Reset,
    Bar(BarId),
    Malformed,
}

fn parse_notification(payload: &str, reset_sentinel: &str) -> Notification {
    if payload == reset_sentinel {
        return Notification::Reset;
    }
    match payload.parse::<BarId>() {
        Ok(id) => Notification::Bar(id),
        Err(_) => Notification::Malformed,
    }
}

pub struct SyncCoordinator<N> {
    notifications: N,
    status: Arc<dyn StatusReader>,
    poll_interval: Duration,
    max_wait: Duration,
    drain_grace: Duration,
    reset_sentinel: String,
}

impl<N: NotificationSource> SyncCoordinator<N> {
    pub fn new(notifications: N, status: Arc<dyn StatusReader>, config: &StageConfig) -> Self {
        Self {
            notifications,
            status,
            poll_interval: config.poll_interval(),
            max_wait: config.max_sync_wait(),
            drain_grace: config.drain_grace(),
            reset_sentinel: config.reset_sentinel.clone(),
        }
    }

    /// Block until `bar` is confirmed downstream or the wait is interrupted
    pub async fn wait_for(&mut self, bar: &Bar) -> Result<SyncOutcome> {
        self.wait_for_or_cancel(bar, &mut std::future::pending()).await
    }

    /// Like [`wait_for`](Self::wait_for), ending with `Cancelled` as soon as
    /// `cancel` resolves. `cancel` is not polled again after it has fired.
    pub async fn wait_for_or_cancel(
        &mut self,
        bar: &Bar,
        cancel: &mut (impl Future<Output = ()> + Unpin),
    ) -> Result<SyncOutcome> {
        let partition = bar.partition();
        let deadline = Instant::now() + self.max_wait;

        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "[{}] No confirmation for {} after {:?} - giving up",
                    partition, bar.id, self.max_wait
                );
                return Ok(SyncOutcome::TimedOut);
            }
            let window = self.poll_interval.min(deadline - now);

            let next = tokio::select! {
                _ = &mut *cancel => {
                    info!("[{}] Wait for {} cancelled", partition, bar.id);
                    return Ok(SyncOutcome::Cancelled);
                }
                next = self.notifications.next_within(window) => next?,
            };

            let Some(payload) = next else {
                let mode = self.status.ingestion_mode(&bar.symbol).await?;
                if mode.is_halted() {
                    info!("[{}] Ingestion {} while waiting for {}", partition, mode, bar.id);
                    return Ok(SyncOutcome::ModeInterrupted(mode));
                }
                continue;
            };

            if payload == bar.id {
                return Ok(SyncOutcome::Confirmed);
            }

            match parse_notification(&payload, &self.reset_sentinel) {
                Notification::Reset => {
                    warn!("[{}] Pipeline reset while waiting for {}", partition, bar.id);
                    let until = deadline.min(Instant::now() + self.drain_grace);
                    self.drain_until(until).await?;
                    return Ok(SyncOutcome::Reset);
                }
                Notification::Bar(id) if id.partition() == partition && id.time > bar.time => {
                    warn!("[{}] {} superseded by {}", partition, bar.id, payload);
                    return Ok(SyncOutcome::Stale { newer: payload });
                }
                Notification::Bar(_) => {}
                Notification::Malformed => {
                    debug!("[{}] Ignoring notification '{}'", partition, payload);
                }
            }
        }
    }

    /// Drop buffered notifications plus whatever arrives within the drain
    /// grace period; returns how many were dropped
    pub async fn discard_stale(&mut self) -> Result<usize> {
        let until = Instant::now() + self.drain_grace;
        self.drain_until(until).await
    }

    /// Never runs past `until`, however busy the channel is
    async fn drain_until(&mut self, until: Instant) -> Result<usize> {
        let mut dropped = self.notifications.drain_buffered()?;
        loop {
            let now = Instant::now();
            if now >= until {
                break;
            }
            match self.notifications.next_within(until - now).await? {
                Some(_) => dropped += 1 + self.notifications.drain_buffered()?,
                None => break,
            }
        }
        if dropped > 0 {
            debug!("Discarded {} buffered notifications", dropped);
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BroadcastNotifications, MemoryBus, Notifier};
    use crate::store::MemoryStore;

    fn bar(time: i64) -> Bar {
        Bar::new("BTCUSDT", "1h", time, 1.0, 2.0, 0.5, 1.5, 10.0)
    }

    async fn setup(
        mode: Option<IngestionMode>,
    ) -> (MemoryBus, Notifier, Arc<MemoryStore>, SyncCoordinator<BroadcastNotifications>) {
        let (bus, _ends) = MemoryBus::new(64);
        let store = Arc::new(MemoryStore::new());
        if let Some(mode) = mode {
            store.set_mode("BTCUSDT", mode).await;
        }
        let sync = SyncCoordinator::new(bus.subscribe(), store.clone(), &StageConfig::default());
        let notifier = bus.notifier();
        (bus, notifier, store, sync)
    }

    #[test]
    fn test_parse_notification() {
        assert_eq!(parse_notification("PIPELINE_RESET", "PIPELINE_RESET"), Notification::Reset);
        assert!(matches!(
            parse_notification("BTCUSDT:1h:bar:5", "PIPELINE_RESET"),
            Notification::Bar(BarId { time: 5, .. })
        ));
        assert_eq!(parse_notification("hello", "PIPELINE_RESET"), Notification::Malformed);
        assert_eq!(
            parse_notification("BTCUSDT:1h:bar:later", "PIPELINE_RESET"),
            Notification::Malformed
        );
        assert_eq!(
            parse_notification("BTCUSDT:1h:mth:5", "PIPELINE_RESET"),
            Notification::Malformed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed() {
        let (_bus, notifier, _store, mut sync) = setup(Some(IngestionMode::Running)).await;
        let b = bar(1000);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            notifier.publish("ETHUSDT:1h:bar:1000");
            notifier.publish("BTCUSDT:1h:bar:1000");
        });

        assert_eq!(sync.wait_for(&b).await.unwrap(), SyncOutcome::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_drains_buffer() {
        let (_bus, notifier, _store, mut sync) = setup(Some(IngestionMode::Running)).await;

        notifier.publish("PIPELINE_RESET");
        notifier.publish("BTCUSDT:1h:bar:1000");
        notifier.publish("BTCUSDT:1h:bar:2000");

        assert_eq!(sync.wait_for(&bar(1000)).await.unwrap(), SyncOutcome::Reset);
        assert_eq!(sync.discard_stale().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_bar_same_partition_is_stale() {
        let (_bus, notifier, _store, mut sync) = setup(Some(IngestionMode::Running)).await;

        notifier.publish("BTCUSDT:1h:bar:500");
        notifier.publish("BTCUSDT:4h:bar:5000");
        notifier.publish("BTCUSDT:1h:bar:2000");

        assert_eq!(
            sync.wait_for(&bar(1000)).await.unwrap(),
            SyncOutcome::Stale {
                newer: "BTCUSDT:1h:bar:2000".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_mode_interrupts_after_poll_interval() {
        let (_bus, _notifier, _store, mut sync) = setup(Some(IngestionMode::Paused)).await;

        let start = Instant::now();
        assert_eq!(
            sync.wait_for(&bar(1000)).await.unwrap(),
            SyncOutcome::ModeInterrupted(IngestionMode::Paused)
        );
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_status_counts_as_stopped() {
        let (_bus, _notifier, _store, mut sync) = setup(None).await;
        assert_eq!(
            sync.wait_for(&bar(1000)).await.unwrap(),
            SyncOutcome::ModeInterrupted(IngestionMode::Stopped)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_change_mid_wait() {
        let (_bus, _notifier, store, mut sync) = setup(Some(IngestionMode::Running)).await;

        let s = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            s.set_mode("BTCUSDT", IngestionMode::Stopped).await;
        });

        let start = Instant::now();
        assert_eq!(
            sync.wait_for(&bar(1000)).await.unwrap(),
            SyncOutcome::ModeInterrupted(IngestionMode::Stopped)
        );
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_ceiling() {
        let (_bus, notifier, _store, mut sync) = setup(Some(IngestionMode::Running)).await;

        tokio::spawn(async move {
            for _ in 0..30 {
                tokio::time::sleep(Duration::from_secs(3)).await;
                notifier.publish("garbage");
            }
        });

        let start = Instant::now();
        assert_eq!(sync.wait_for(&bar(1000)).await.unwrap(), SyncOutcome::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_bar_is_ignored() {
        let (_bus, notifier, _store, mut sync) = setup(Some(IngestionMode::Running)).await;

        notifier.publish("BTCUSDT:1h:bar:500");
        notifier.publish("BTCUSDT:1h:bar:1000");
        assert_eq!(sync.wait_for(&bar(1000)).await.unwrap(), SyncOutcome::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zone_id_with_later_time_is_not_stale() {
        let (_bus, notifier, _store, mut sync) = setup(Some(IngestionMode::Running)).await;

        notifier.publish("BTCUSDT:1h:mth:5000");
        notifier.publish("BTCUSDT:1h:bar:1000");
        assert_eq!(sync.wait_for(&bar(1000)).await.unwrap(), SyncOutcome::Confirmed);
    }

    fn spawn_steady_traffic(notifier: Notifier, every: Duration) {
        tokio::spawn(async move {
            for i in 0..5_000 {
                tokio::time::sleep(every).await;
                notifier.publish(&format!("ETHUSDT:1h:bar:{}", i));
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_returns_under_steady_cross_partition_traffic() {
        let (_bus, notifier, _store, mut sync) = setup(Some(IngestionMode::Running)).await;

        notifier.publish("PIPELINE_RESET");
        spawn_steady_traffic(notifier, Duration::from_millis(50));

        let start = Instant::now();
        assert_eq!(sync.wait_for(&bar(1000)).await.unwrap(), SyncOutcome::Reset);
        assert!(start.elapsed() <= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reset_stays_within_ceiling() {
        let (_bus, notifier, _store, mut sync) = setup(Some(IngestionMode::Running)).await;

        let late = notifier.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(59_980)).await;
            late.publish("PIPELINE_RESET");
        });
        spawn_steady_traffic(notifier, Duration::from_millis(30));

        let start = Instant::now();
        assert_eq!(sync.wait_for(&bar(1000)).await.unwrap(), SyncOutcome::Reset);
        assert!(start.elapsed() <= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_stale_is_bounded_by_grace() {
        let (_bus, notifier, _store, mut sync) = setup(Some(IngestionMode::Running)).await;

        notifier.publish("BTCUSDT:1h:bar:1000");
        notifier.publish("BTCUSDT:1h:bar:2000");
        spawn_steady_traffic(notifier, Duration::from_millis(20));

        let start = Instant::now();
        let dropped = sync.discard_stale().await.unwrap();
        assert!(dropped >= 3);
        assert!(start.elapsed() <= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ends_wait() {
        let (_bus, _notifier, _store, mut sync) = setup(Some(IngestionMode::Running)).await;
        let mut cancel = Box::pin(tokio::time::sleep(Duration::from_secs(1)));

        let start = Instant::now();
        assert_eq!(
            sync.wait_for_or_cancel(&bar(1000), &mut cancel).await.unwrap(),
            SyncOutcome::Cancelled
        );
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }
}
