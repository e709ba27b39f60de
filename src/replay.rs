//! Offline replay against the in-memory backend
//!
//! Seeds zones, levels and ingestion statuses from a JSON fixture, feeds its
//! bars through a [`Worker`], and plays the final pipeline stage with an echo
//! task that confirms each forwarded bar.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{MemoryBus, MemoryEnds, Notifier};
use crate::config::StageConfig;
use crate::error::Result;
use crate::orchestrator::{RunSummary, StageContext, StageOrchestrator, Worker};
use crate::store::MemoryStore;
use crate::types::{Bar, BarRecord, IngestionMode};
use crate::zones_core::{Level, Zone};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Fixture {
    /// Ingestion mode per symbol; symbols left out read as stopped
    #[serde(default)]
    pub statuses: HashMap<String, IngestionMode>,
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub levels: Vec<Level>,
    pub bars: Vec<BarRecord>,
}

impl Fixture {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Behaviour of the simulated downstream stage
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Delay before each confirmation is published
    pub echo_delay: Duration,
    /// Withhold every n-th confirmation
    pub drop_every: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub summary: RunSummary,
    pub confirmations_sent: usize,
    pub zones: Vec<Zone>,
}

pub async fn run_replay(
    fixture: Fixture,
    config: StageConfig,
    options: ReplayOptions,
    shutdown: impl Future<Output = ()>,
) -> Result<ReplayReport> {
    let store = Arc::new(MemoryStore::new());
    for (symbol, mode) in &fixture.statuses {
        store.set_mode(symbol, *mode).await;
    }
    for zone in fixture.zones {
        store.insert_zone(zone).await;
    }
    for level in fixture.levels {
        store.insert_level(level).await;
    }

    let (bus, MemoryEnds { source, sink, output }) = MemoryBus::new(config.notification_capacity);
    let echo = tokio::spawn(echo_downstream(output, bus.notifier(), options));

    let ctx = StageContext {
        store: store.clone(),
        status: store.clone(),
        sink: Arc::new(sink),
        config,
    };
    let orchestrator = StageOrchestrator::new(ctx, bus.subscribe());

    info!("Replaying {} bars", fixture.bars.len());
    for record in fixture.bars {
        bus.publish_bar(Bar::from(record))?;
    }
    // Input stream ends once the queued bars are consumed
    drop(bus);

    let summary = Worker::new(source, orchestrator).run(shutdown).await?;

    let confirmations_sent = match echo.await {
        Ok(sent) => sent,
        Err(e) => {
            warn!("Echo task failed: {}", e);
            0
        }
    };

    Ok(ReplayReport {
        summary,
        confirmations_sent,
        zones: store.zones().await,
    })
}

/// Confirm forwarded bars until the worker's sink is dropped
async fn echo_downstream(
    mut output: mpsc::UnboundedReceiver<String>,
    notifier: Notifier,
    options: ReplayOptions,
) -> usize {
    let mut seen = 0;
    let mut sent = 0;

    while let Some(payload) = output.recv().await {
        seen += 1;
        let bar: Bar = match serde_json::from_str(&payload) {
            Ok(bar) => bar,
            Err(e) => {
                warn!("Unreadable forwarded bar: {}", e);
                continue;
            }
        };

        if options.drop_every.is_some_and(|n| n > 0 && seen % n == 0) {
            debug!("Withholding confirmation for {}", bar.id);
            continue;
        }
        if !options.echo_delay.is_zero() {
            tokio::time::sleep(options.echo_delay).await;
        }
        notifier.publish(&bar.id);
        sent += 1;
    }

    sent
}
