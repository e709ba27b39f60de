// Library crate - levels-and-zones stage of the market-structure pipeline

pub mod types;
pub mod error;
pub mod config;
pub mod zones_core;
pub mod store;
pub mod bus;
pub mod sync;
pub mod orchestrator;
pub mod replay;

// Re-export commonly used types
pub use types::*;
pub use error::{Result, StageError};
pub use config::StageConfig;
pub use orchestrator::{BarOutcome, RunSummary, StageContext, StageOrchestrator, Worker};
pub use sync::{SyncCoordinator, SyncOutcome};
