//! Stage configuration
//!
//! Defaults match the production pipeline; the binary overrides the sync
//! timings and consumer name from flags / environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::zones_core::ThresholdPolicy;

pub const DEFAULT_CONSUMER_GROUP: &str = "03_levels_and_zones";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stream of cleaned bars this stage consumes
    pub input_stream: String,
    /// Stream the annotated bars are forwarded to
    pub output_stream: String,
    pub consumer_group: String,
    pub consumer_name: String,
    /// Pub/sub channel carrying downstream confirmations
    pub notification_channel: String,
    pub reset_sentinel: String,
    /// Quiet period after which the ingestion mode is re-checked
    pub sync_poll_interval_secs: u64,
    /// Hard ceiling on the wait for one confirmation
    pub max_sync_wait_secs: u64,
    /// Silence that ends a drain of buffered notifications
    pub drain_grace_ms: u64,
    pub notification_capacity: usize,
    pub policy: ThresholdPolicy,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            input_stream: "stream:clean_candles".to_string(),
            output_stream: "stream:leveled_and_updated".to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_name: default_consumer_name(DEFAULT_CONSUMER_GROUP),
            notification_channel: "processed_bar".to_string(),
            reset_sentinel: "PIPELINE_RESET".to_string(),
            sync_poll_interval_secs: 5,
            max_sync_wait_secs: 60,
            drain_grace_ms: 100,
            notification_capacity: 1024,
            policy: ThresholdPolicy::default(),
        }
    }
}

impl StageConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync_poll_interval_secs.max(1))
    }

    pub fn max_sync_wait(&self) -> Duration {
        Duration::from_secs(self.max_sync_wait_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

/// `{group}-{pid}`, unique per process on one host
pub fn default_consumer_name(group: &str) -> String {
    format!("{}-{}", group, std::process::id())
}
