//! Cancellation controller: sets and reads the session cancellation flag
//!
//! Cancellation is cooperative only. The flag stops the scheduler from
//! launching pending batches and workers from dispatching further probes;
//! nothing is hard-killed, so no probe result is ever half-written.

use crate::orchestrator::OrchestratorError;
use crate::store::sessions::SessionStore;
use tracing::info;

#[derive(Clone)]
pub struct CancellationController {
    sessions: SessionStore,
}

impl CancellationController {
    pub fn new(sessions: SessionStore) -> Self {
        Self { sessions }
    }

    /// Set the flag. Idempotent: cancelling an already-cancelled session
    /// succeeds and changes nothing.
    pub async fn cancel(&self, session_id: &str) -> Result<(), OrchestratorError> {
        if !self.sessions.set_cancelled(session_id).await? {
            return Err(OrchestratorError::NotFound(session_id.to_string()));
        }
        info!("session {session_id} cancelled");
        Ok(())
    }

    pub async fn is_cancelled(&self, session_id: &str) -> Result<bool, OrchestratorError> {
        self.sessions
            .is_cancelled(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(session_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::session::plan_batches;
    use crate::store::sessions::SessionRow;
    use crate::store::Store;
    use chrono::Utc;

    async fn controller_with_session() -> (tempfile::TempDir, CancellationController) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(path.to_str().unwrap()).await.unwrap();
        store.migrate().await.unwrap();

        let sessions = SessionStore::new(store.pool().clone());
        let row = SessionRow {
            id: "s1".to_string(),
            offline_only: false,
            max_processes: 2,
            batch_size: 10,
            worker_concurrency: 5,
            total_proxies: 10,
            total_batches: 1,
            cancelled: false,
            created_at: Utc::now(),
        };
        sessions
            .create_session(&row, &plan_batches(10, 10))
            .await
            .unwrap();

        (dir, CancellationController::new(sessions))
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (_dir, controller) = controller_with_session().await;

        assert!(!controller.is_cancelled("s1").await.unwrap());
        controller.cancel("s1").await.unwrap();
        assert!(controller.is_cancelled("s1").await.unwrap());
        // Second cancel is a no-op, not an error
        controller.cancel("s1").await.unwrap();
        assert!(controller.is_cancelled("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_unknown_session() {
        let (_dir, controller) = controller_with_session().await;

        let err = controller.cancel("nope").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));

        let err = controller.is_cancelled("nope").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }
}
