//! Progress aggregation: folds per-batch state into session-level metrics

use crate::orchestrator::session::BatchStatus;
use crate::orchestrator::OrchestratorError;
use crate::store::sessions::{BatchRow, SessionRow, SessionStore};
use serde::Serialize;

/// One batch's id and state, in batch order
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub batch_id: u32,
    pub status: BatchStatus,
}

/// Session-level progress as of one consistent snapshot of batch state
#[derive(Debug, Clone, Serialize)]
pub struct ProgressView {
    pub total_proxies: u64,
    pub total_batches: u32,
    pub total_checked: u64,
    pub total_online: u64,
    pub total_offline: u64,
    /// Percent checked; 0 for an empty run, saturates at 100
    pub overall_progress: u8,
    pub batch_statuses: Vec<BatchProgress>,
    pub active_batches: u32,
    pub completed_batches: u32,
    pub failed_batches: u32,
    pub cancelled: bool,
    /// Strict completion: every batch completed, none running, and every
    /// target checked. All three are taken from the same snapshot; 100%
    /// progress alone never implies this.
    pub is_complete: bool,
    /// Terminal: nothing is running and nothing more will start. Holds
    /// for clean completion, for cancelled runs, and for runs with
    /// failed batches.
    pub is_finished: bool,
}

/// Read-only view over the session state store.
///
/// Safe to poll at short intervals: a progress read never mutates
/// anything.
#[derive(Clone)]
pub struct ProgressAggregator {
    sessions: SessionStore,
}

impl ProgressAggregator {
    pub fn new(sessions: SessionStore) -> Self {
        Self { sessions }
    }

    pub async fn progress(&self, session_id: &str) -> Result<ProgressView, OrchestratorError> {
        let session = self
            .sessions
            .get_session(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(session_id.to_string()))?;
        let batches = self.sessions.batch_snapshot(session_id).await?;

        Ok(fold_progress(&session, &batches))
    }
}

/// Fold one snapshot of batch rows into the session view
pub fn fold_progress(session: &SessionRow, batches: &[BatchRow]) -> ProgressView {
    let total_checked: u64 = batches.iter().map(|b| b.checked_count).sum();
    let total_online: u64 = batches.iter().map(|b| b.online_count).sum();
    let total_offline: u64 = batches.iter().map(|b| b.offline_count).sum();

    let active_batches = batches.iter().filter(|b| b.status.is_running()).count() as u32;
    let completed_batches = batches
        .iter()
        .filter(|b| b.status == BatchStatus::Completed)
        .count() as u32;
    let failed_batches = batches
        .iter()
        .filter(|b| b.status == BatchStatus::Failed)
        .count() as u32;
    let pending_batches = batches.iter().filter(|b| b.status.is_pending()).count() as u32;

    let overall_progress = if session.total_proxies == 0 {
        0
    } else {
        (total_checked * 100 / session.total_proxies).min(100) as u8
    };

    let is_complete = completed_batches == session.total_batches
        && active_batches == 0
        && total_checked >= session.total_proxies;

    let is_finished = active_batches == 0 && (pending_batches == 0 || session.cancelled);

    ProgressView {
        total_proxies: session.total_proxies,
        total_batches: session.total_batches,
        total_checked,
        total_online,
        total_offline,
        overall_progress,
        batch_statuses: batches
            .iter()
            .map(|b| BatchProgress {
                batch_id: b.batch_id,
                status: b.status,
            })
            .collect(),
        active_batches,
        completed_batches,
        failed_batches,
        cancelled: session.cancelled,
        is_complete,
        is_finished,
    }
}
