//! In-process bus: tokio `mpsc` for the streams, `broadcast` for pub/sub

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout_at, Instant};
use tracing::warn;

use super::{BarSink, BarSource, Delivery, NotificationSource};
use crate::error::{Result, StageError};
use crate::types::Bar;

/// Publisher side of the input stream and the notification channel
pub struct MemoryBus {
    input: mpsc::UnboundedSender<Delivery>,
    notifications: broadcast::Sender<String>,
    seq: AtomicU64,
}

/// Worker-side ends handed out by [`MemoryBus::new`]
pub struct MemoryEnds {
    pub source: MemoryBarSource,
    pub sink: MemoryBarSink,
    /// JSON payloads forwarded by the worker, in order
    pub output: mpsc::UnboundedReceiver<String>,
}

impl MemoryBus {
    pub fn new(notification_capacity: usize) -> (Self, MemoryEnds) {
        let (input, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(notification_capacity);

        let bus = Self {
            input,
            notifications,
            seq: AtomicU64::new(0),
        };
        let ends = MemoryEnds {
            source: MemoryBarSource {
                rx: input_rx,
                acked: Vec::new(),
            },
            sink: MemoryBarSink { tx: output_tx },
            output,
        };
        (bus, ends)
    }

    /// Append a bar to the input stream; returns its message id
    pub fn publish_bar(&self, bar: Bar) -> Result<String> {
        let message_id = format!("{}-0", self.seq.fetch_add(1, Ordering::Relaxed) + 1);
        self.input
            .send(Delivery {
                message_id: message_id.clone(),
                bar,
            })
            .map_err(|_| StageError::ChannelClosed("input"))?;
        Ok(message_id)
    }

    pub fn notifier(&self) -> Notifier {
        Notifier {
            tx: self.notifications.clone(),
        }
    }

    pub fn subscribe(&self) -> BroadcastNotifications {
        BroadcastNotifications {
            rx: self.notifications.subscribe(),
        }
    }
}

/// Cloneable publisher for the notification channel
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<String>,
}

impl Notifier {
    /// Fire-and-forget; returns the number of subscribers reached
    pub fn publish(&self, payload: &str) -> usize {
        self.tx.send(payload.to_string()).unwrap_or(0)
    }
}

pub struct MemoryBarSource {
    rx: mpsc::UnboundedReceiver<Delivery>,
    acked: Vec<String>,
}

impl MemoryBarSource {
    pub fn acked(&self) -> &[String] {
        &self.acked
    }
}

#[async_trait]
impl BarSource for MemoryBarSource {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        Ok(self.rx.recv().await)
    }

    async fn ack(&mut self, message_id: &str) -> Result<()> {
        self.acked.push(message_id.to_string());
        Ok(())
    }
}

pub struct MemoryBarSink {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl BarSink for MemoryBarSink {
    async fn forward(&self, bar: &Bar) -> Result<()> {
        let payload = serde_json::to_string(bar)?;
        self.tx
            .send(payload)
            .map_err(|_| StageError::ChannelClosed("output"))
    }
}

/// Subscriber on the notification channel
pub struct BroadcastNotifications {
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl NotificationSource for BroadcastNotifications {
    async fn next_within(&mut self, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            match timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(payload)) => return Ok(Some(payload)),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!("Notification subscriber lagged, {} payloads dropped", skipped);
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(StageError::ChannelClosed("notification"));
                }
            }
        }
    }

    fn drain_buffered(&mut self) -> Result<usize> {
        let mut dropped = 0;
        loop {
            match self.rx.try_recv() {
                Ok(_) => dropped += 1,
                Err(TryRecvError::Empty) => return Ok(dropped),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Notification subscriber lagged, {} payloads dropped", skipped);
                    dropped += skipped as usize;
                }
                Err(TryRecvError::Closed) => {
                    return Err(StageError::ChannelClosed("notification"));
                }
            }
        }
    }
}
