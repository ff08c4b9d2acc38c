//! Parallel health-check orchestrator
//!
//! Fans a proxy list out across bounded-concurrency batch workers, keeps
//! all run state durable in the session store so progress can be polled
//! from anywhere, and supports cooperative cancellation.

pub mod api;
pub mod control;
pub mod progress;
pub mod scheduler;
pub mod session;
pub mod worker;

pub use api::{Api, CancelReply, ProgressReply, StartReply};
pub use control::CancellationController;
pub use progress::{ProgressAggregator, ProgressView};
pub use scheduler::{Scheduler, StartOutcome};
pub use session::{BatchSlice, BatchStatus, SessionOptions};
pub use worker::{BatchSpec, BatchWorker};

use thiserror::Error;

/// Errors surfaced by the orchestrator.
///
/// Per-proxy probe failures and per-batch worker failures are never
/// errors at this level: they are recorded in proxy and batch state and
/// the run continues. Only bad input, unknown sessions, and a broken
/// state store reach the caller.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown session: {0}")]
    NotFound(String),

    #[error("session state store unavailable: {0}")]
    Storage(#[from] sqlx::Error),
}
