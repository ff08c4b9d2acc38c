//! Check-session model: run options, batch planning, batch states

use crate::orchestrator::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Concurrency cap for offline-only runs
pub const OFFLINE_MAX_PROCESSES: u32 = 8;

/// Batch size for offline-only runs
pub const OFFLINE_BATCH_SIZE: u32 = 50;

/// Default concurrency cap for full runs
pub const DEFAULT_MAX_PROCESSES: u32 = 12;

/// Default batch size for full runs
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Default probes in flight inside one worker
pub const DEFAULT_WORKER_CONCURRENCY: u32 = 5;

/// Default time a running batch may go without a heartbeat
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Default wall-clock cap on a whole session
pub const DEFAULT_SESSION_DEADLINE: Duration = Duration::from_secs(3600);

/// Default supervisor wake-up interval
pub const DEFAULT_SUPERVISOR_INTERVAL: Duration = Duration::from_millis(500);

/// Options for one check run
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Restrict the target set to currently-offline proxies
    pub offline_only: bool,
    /// Concurrency cap on batch workers
    pub max_processes: u32,
    /// Proxies per batch
    pub batch_size: u32,
    /// Probes in flight inside one worker
    pub worker_concurrency: u32,
    /// A running batch with no heartbeat for this long is failed
    pub liveness_timeout: Duration,
    /// Hard wall-clock cap on the whole session
    pub session_deadline: Duration,
    /// How often the supervisor loop wakes up
    pub supervisor_interval: Duration,
}

impl SessionOptions {
    /// Options for a full run over every stored proxy
    pub fn full_run() -> Self {
        Self {
            offline_only: false,
            max_processes: DEFAULT_MAX_PROCESSES,
            batch_size: DEFAULT_BATCH_SIZE,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            session_deadline: DEFAULT_SESSION_DEADLINE,
            supervisor_interval: DEFAULT_SUPERVISOR_INTERVAL,
        }
    }

    /// Options for a run restricted to offline proxies; smaller defaults
    pub fn offline_only() -> Self {
        Self {
            offline_only: true,
            max_processes: OFFLINE_MAX_PROCESSES,
            batch_size: OFFLINE_BATCH_SIZE,
            ..Self::full_run()
        }
    }

    pub fn with_max_processes(mut self, max_processes: u32) -> Self {
        self.max_processes = max_processes;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_worker_concurrency(mut self, worker_concurrency: u32) -> Self {
        self.worker_concurrency = worker_concurrency;
        self
    }

    pub fn with_liveness_timeout(mut self, liveness_timeout: Duration) -> Self {
        self.liveness_timeout = liveness_timeout;
        self
    }

    pub fn with_session_deadline(mut self, session_deadline: Duration) -> Self {
        self.session_deadline = session_deadline;
        self
    }

    pub fn with_supervisor_interval(mut self, supervisor_interval: Duration) -> Self {
        self.supervisor_interval = supervisor_interval;
        self
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.max_processes < 1 {
            return Err(OrchestratorError::InvalidArgument(
                "max_processes must be at least 1".to_string(),
            ));
        }
        if self.batch_size < 1 {
            return Err(OrchestratorError::InvalidArgument(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.worker_concurrency < 1 {
            return Err(OrchestratorError::InvalidArgument(
                "worker_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::full_run()
    }
}

/// Batch lifecycle. Transitions only move forward:
/// pending -> running -> completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    /// Lenient decode for stored rows; unknown strings read as failed so
    /// a corrupted row can never keep a session alive forever
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => BatchStatus::Pending,
            "running" => BatchStatus::Running,
            "completed" => BatchStatus::Completed,
            _ => BatchStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, BatchStatus::Pending)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, BatchStatus::Running)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One planned slice of the target set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSlice {
    pub batch_id: u32,
    pub start_offset: u64,
    pub limit: u32,
}

/// Slice `total` targets into ceil(total / batch_size) contiguous batches.
/// The last batch covers whatever remains.
pub fn plan_batches(total: u64, batch_size: u32) -> Vec<BatchSlice> {
    let batch_size = batch_size.max(1) as u64;
    let count = total.div_ceil(batch_size);

    (0..count)
        .map(|i| {
            let start_offset = i * batch_size;
            BatchSlice {
                batch_id: i as u32,
                start_offset,
                limit: (total - start_offset).min(batch_size) as u32,
            }
        })
        .collect()
}

/// Fresh opaque session id; random so concurrent starts never collide
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}
