//! Error types for the levels-and-zones stage
//!
//! Only failures the worker cannot recover from locally live here: store and
//! transport failures, serialization failures, and single-writer violations.
//! Interruptions of the sync wait (reset, pause, stale, timeout) are ordinary
//! [`crate::sync::SyncOutcome`] values, not errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    /// Backing store rejected or failed an operation
    #[error("store error: {0}")]
    Store(String),

    /// Record could not be encoded or decoded
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A second worker tried to drive a partition that is already claimed
    #[error("partition {partition} is already driven by worker {holder}")]
    PartitionConflict { partition: String, holder: String },

    /// A bus channel was closed by its other end
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    /// String is not a `{symbol}:{timeframe}:bar:{epoch_ms}` id
    #[error("invalid bar id '{0}'")]
    InvalidBarId(String),
}

pub type Result<T> = std::result::Result<T, StageError>;
