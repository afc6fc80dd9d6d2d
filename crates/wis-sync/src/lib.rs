//! Incremental extraction and membership reconciliation engine.

use thiserror::Error;
use wis_adapters::FetchError;
use wis_storage::PersistenceError;

mod batch;
mod budget;
mod collision;
mod config;
mod paginate;
mod queue;
mod reconcile;
mod retry;
mod run;
mod scheduler;
mod service;
#[cfg(test)]
mod test_support;

pub use batch::adjust as adjust_batch_size;
pub use budget::{TimeBudget, DEFAULT_SAFETY_MARGIN_SECS};
pub use collision::{CollisionWindow, WATERMARK_TICK_MILLIS};
pub use config::{
    RunSettings, SourceRegistry, StoreBackend, StreamConfig, SyncConfig, DEFAULT_FETCH_FANOUT,
    DEFAULT_RUN_BUDGET_SECS,
};
pub use paginate::{Paginator, Termination, DEFAULT_PAGE_CEILING};
pub use queue::{
    ChannelWorkQueue, MemoryWorkQueue, OutboxWorkQueue, QueueError, WorkMessage, WorkQueue,
};
pub use reconcile::{MembershipReconciler, ReconcileOutcome};
pub use retry::{reschedule_watermark, RetryHandler, DEFAULT_MAX_FETCH_ATTEMPTS};
pub use run::{
    write_run_summary, GroupingOutcome, GroupingStatus, RunKind, RunStatus, RunSummary,
    StreamReport, StreamRun, SyncPipeline, VerifyReport,
};
pub use scheduler::maybe_build_scheduler;
pub use service::SyncService;

pub const CRATE_NAME: &str = "wis-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    /// Storage failed mid-run. The run is aborted and its cursor left untouched.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// Direct item lookup failed.
    #[error("item lookup failed: {0}")]
    Lookup(#[from] FetchError),
}
