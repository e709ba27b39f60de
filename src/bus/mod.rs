//! Message bus seams
//!
//! - [`BarSource`]: ordered, at-least-once delivery of cleaned bars
//! - [`BarSink`]: the stream feeding the next stage
//! - [`NotificationSource`]: bar-id confirmations and the reset sentinel

mod memory;

pub use memory::{BroadcastNotifications, MemoryBarSink, MemoryBarSource, MemoryBus, MemoryEnds, Notifier};

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::types::Bar;

/// One bar taken from the input stream
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Stream message id, handed back on `ack`
    pub message_id: String,
    pub bar: Bar,
}

#[async_trait]
pub trait BarSource: Send {
    /// Next delivery in stream order; `None` once the stream has ended
    async fn next(&mut self) -> Result<Option<Delivery>>;

    async fn ack(&mut self, message_id: &str) -> Result<()>;
}

#[async_trait]
pub trait BarSink: Send + Sync {
    /// Append the annotated bar to the downstream stream
    async fn forward(&self, bar: &Bar) -> Result<()>;
}

#[async_trait]
pub trait NotificationSource: Send {
    /// Next payload published within `timeout`, or `None` if the window passed
    async fn next_within(&mut self, timeout: Duration) -> Result<Option<String>>;

    /// Drop every payload already buffered without waiting; returns the count
    fn drain_buffered(&mut self) -> Result<usize>;
}
