//! Batch worker: runs every probe for one slice of the target set

use crate::orchestrator::OrchestratorError;
use crate::proxy::models::ProxyTarget;
use crate::proxy::prober::Probe;
use crate::store::proxies::ProxyStore;
use crate::store::sessions::SessionStore;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};

/// The slice a worker owns
#[derive(Debug, Clone)]
pub struct BatchSpec {
    pub session_id: String,
    pub batch_id: u32,
    pub start_offset: u64,
    pub limit: u32,
}

/// Checks one batch: fetches its slice, probes each target with bounded
/// internal parallelism, and persists every outcome as it lands.
///
/// The durable cancellation flag is read before each probe is dispatched;
/// once it is set the worker stops taking targets, drains what is already
/// in flight, and closes the batch as completed with the counters it has.
pub struct BatchWorker {
    sessions: SessionStore,
    proxies: Arc<dyn ProxyStore>,
    prober: Arc<dyn Probe>,
    spec: BatchSpec,
    concurrency: usize,
}

impl BatchWorker {
    pub fn new(
        sessions: SessionStore,
        proxies: Arc<dyn ProxyStore>,
        prober: Arc<dyn Probe>,
        spec: BatchSpec,
        concurrency: usize,
    ) -> Self {
        Self {
            sessions,
            proxies,
            prober,
            spec,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(self) -> Result<(), OrchestratorError> {
        let targets = self
            .proxies
            .fetch_batch(
                &self.spec.session_id,
                self.spec.start_offset,
                self.spec.limit as u64,
            )
            .await?;

        debug!(
            "batch {} of session {}: {} targets",
            self.spec.batch_id,
            self.spec.session_id,
            targets.len()
        );

        let mut pending = targets.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut accepting = true;

        loop {
            while accepting && in_flight.len() < self.concurrency {
                if self.cancelled().await? {
                    info!(
                        "batch {} of session {} stopping on cancellation",
                        self.spec.batch_id, self.spec.session_id
                    );
                    accepting = false;
                    break;
                }
                match pending.next() {
                    Some(target) => in_flight.push(self.check_one(target)),
                    None => {
                        accepting = false;
                        break;
                    }
                }
            }

            match in_flight.next().await {
                Some(result) => result?,
                None => break,
            }
        }

        // A cancelled stop still closes as completed, with the counters
        // standing where they stand.
        self.sessions
            .finish_batch(&self.spec.session_id, self.spec.batch_id)
            .await?;

        Ok(())
    }

    async fn check_one(&self, target: ProxyTarget) -> Result<(), OrchestratorError> {
        let result = self.prober.probe(&target).await;

        self.proxies.record_result(&result).await?;
        self.sessions
            .record_batch_progress(&self.spec.session_id, self.spec.batch_id, result.is_online())
            .await?;

        Ok(())
    }

    async fn cancelled(&self) -> Result<bool, OrchestratorError> {
        // A vanished session row also stops the worker
        Ok(self
            .sessions
            .is_cancelled(&self.spec.session_id)
            .await?
            .unwrap_or(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::session::{plan_batches, BatchStatus};
    use crate::proxy::models::{CheckResult, NewProxy, ProxyScheme, ProxyStatus};
    use crate::store::proxies::SqliteProxyStore;
    use crate::store::sessions::SessionRow;
    use crate::store::Store;
    use async_trait::async_trait;
    use chrono::Utc;
    use sqlx::SqlitePool;
    use tempfile::TempDir;

    /// Probe stub: even proxy ids are online, odd ids offline
    struct ParityProbe;

    #[async_trait]
    impl Probe for ParityProbe {
        async fn probe(&self, target: &ProxyTarget) -> CheckResult {
            if target.id % 2 == 0 {
                CheckResult::online(target.id, 10)
            } else {
                CheckResult::offline(target.id, "down".to_string())
            }
        }
    }

    async fn test_pool() -> (TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(path.to_str().unwrap()).await.unwrap();
        store.migrate().await.unwrap();
        (dir, store.pool().clone())
    }

    async fn seed(pool: &SqlitePool, n: usize) -> Arc<SqliteProxyStore> {
        let proxies = Arc::new(SqliteProxyStore::new(pool.clone()));
        for i in 0..n {
            proxies
                .insert(&NewProxy::new(format!("10.0.0.{i}"), 8080, ProxyScheme::Http))
                .await
                .unwrap();
        }
        proxies
    }

    async fn create_session(sessions: &SessionStore, id: &str, total: u64, batch_size: u32) {
        let plan = plan_batches(total, batch_size);
        let row = SessionRow {
            id: id.to_string(),
            offline_only: false,
            max_processes: 2,
            batch_size,
            worker_concurrency: 3,
            total_proxies: total,
            total_batches: plan.len() as u32,
            cancelled: false,
            created_at: Utc::now(),
        };
        sessions.create_session(&row, &plan).await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_checks_its_whole_slice() {
        let (_dir, pool) = test_pool().await;
        let proxies = seed(&pool, 7).await;
        let sessions = SessionStore::new(pool.clone());

        proxies.snapshot_targets("s1", false).await.unwrap();
        create_session(&sessions, "s1", 7, 10).await;
        sessions.claim_batch("s1", 0, 2).await.unwrap();

        let worker = BatchWorker::new(
            sessions.clone(),
            proxies.clone(),
            Arc::new(ParityProbe),
            BatchSpec {
                session_id: "s1".to_string(),
                batch_id: 0,
                start_offset: 0,
                limit: 10,
            },
            3,
        );
        worker.run().await.unwrap();

        let batches = sessions.batch_snapshot("s1").await.unwrap();
        assert_eq!(batches[0].status, BatchStatus::Completed);
        assert_eq!(batches[0].checked_count, 7);
        assert_eq!(
            batches[0].online_count + batches[0].offline_count,
            batches[0].checked_count
        );

        // Every proxy status was persisted
        let checked = proxies
            .list(None)
            .await
            .unwrap()
            .iter()
            .filter(|p| p.status != ProxyStatus::Unchecked)
            .count();
        assert_eq!(checked, 7);
    }

    #[tokio::test]
    async fn test_worker_stops_on_cancellation() {
        let (_dir, pool) = test_pool().await;
        let proxies = seed(&pool, 20).await;
        let sessions = SessionStore::new(pool.clone());

        proxies.snapshot_targets("s1", false).await.unwrap();
        create_session(&sessions, "s1", 20, 20).await;
        sessions.claim_batch("s1", 0, 2).await.unwrap();
        // Flag set before the worker starts: it must take no targets at all
        sessions.set_cancelled("s1").await.unwrap();

        let worker = BatchWorker::new(
            sessions.clone(),
            proxies.clone(),
            Arc::new(ParityProbe),
            BatchSpec {
                session_id: "s1".to_string(),
                batch_id: 0,
                start_offset: 0,
                limit: 20,
            },
            3,
        );
        worker.run().await.unwrap();

        let batches = sessions.batch_snapshot("s1").await.unwrap();
        // Cancelled stop is completed, not failed
        assert_eq!(batches[0].status, BatchStatus::Completed);
        assert_eq!(batches[0].checked_count, 0);
    }
}
