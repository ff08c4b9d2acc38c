//! Scheduler: creates check sessions and keeps their batches flowing

use crate::orchestrator::session::{new_session_id, plan_batches, SessionOptions};
use crate::orchestrator::worker::{BatchSpec, BatchWorker};
use crate::orchestrator::OrchestratorError;
use crate::proxy::prober::Probe;
use crate::store::proxies::ProxyStore;
use crate::store::sessions::{BatchRow, SessionRow, SessionStore};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What `start` hands back to the caller
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    /// None when there was nothing to check and no session was created
    pub session_id: Option<String>,
    pub total_proxies: u64,
    pub total_batches: u32,
    pub batch_size: u32,
    pub max_processes: u32,
}

/// Creates sessions, launches batch workers up to the concurrency cap,
/// and supervises runs to a terminal state.
///
/// All scheduling decisions go through the durable session store; the
/// in-process supervisor task is just a heartbeat that calls the same
/// `pump` a progress poll may call, so a run keeps moving no matter which
/// side touches it.
#[derive(Clone)]
pub struct Scheduler {
    sessions: SessionStore,
    proxies: Arc<dyn ProxyStore>,
    prober: Arc<dyn Probe>,
}

impl Scheduler {
    pub fn new(sessions: SessionStore, proxies: Arc<dyn ProxyStore>, prober: Arc<dyn Probe>) -> Self {
        Self {
            sessions,
            proxies,
            prober,
        }
    }

    /// Create a session over the (optionally offline-only) target set,
    /// launch the first wave of batches, and hand back its id.
    ///
    /// An empty target set is a success with nothing to poll: no session
    /// row is written and `session_id` is None.
    pub async fn start(&self, opts: SessionOptions) -> Result<StartOutcome, OrchestratorError> {
        opts.validate()?;

        let session_id = new_session_id();
        let total = self
            .proxies
            .snapshot_targets(&session_id, opts.offline_only)
            .await?;

        if total == 0 {
            info!("check run requested but no matching proxies exist");
            return Ok(StartOutcome {
                session_id: None,
                total_proxies: 0,
                total_batches: 0,
                batch_size: opts.batch_size,
                max_processes: opts.max_processes,
            });
        }

        let plan = plan_batches(total, opts.batch_size);
        let session = SessionRow {
            id: session_id.clone(),
            offline_only: opts.offline_only,
            max_processes: opts.max_processes,
            batch_size: opts.batch_size,
            worker_concurrency: opts.worker_concurrency,
            total_proxies: total,
            total_batches: plan.len() as u32,
            cancelled: false,
            created_at: Utc::now(),
        };
        self.sessions.create_session(&session, &plan).await?;

        info!(
            "session {session_id}: {} proxies in {} batches (cap {}, offline_only {})",
            total,
            plan.len(),
            opts.max_processes,
            opts.offline_only
        );

        let outcome = StartOutcome {
            session_id: Some(session_id.clone()),
            total_proxies: total,
            total_batches: plan.len() as u32,
            batch_size: opts.batch_size,
            max_processes: opts.max_processes,
        };

        // First wave, then a supervisor to keep refilling
        self.pump(&session_id).await?;
        self.spawn_supervisor(session_id, opts);

        Ok(outcome)
    }

    /// Launch pending batches while occupancy is below the cap and the
    /// session is not cancelled. Safe to call from anywhere, any number
    /// of times: the atomic pending->running claim arbitrates.
    pub async fn pump(&self, session_id: &str) -> Result<u32, OrchestratorError> {
        let session = self
            .sessions
            .get_session(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(session_id.to_string()))?;

        if session.cancelled {
            return Ok(0);
        }

        let batches = self.sessions.batch_snapshot(session_id).await?;
        let mut running = batches.iter().filter(|b| b.status.is_running()).count() as u32;
        let mut launched = 0;

        for batch in batches.iter().filter(|b| b.status.is_pending()) {
            if running >= session.max_processes {
                break;
            }
            if self
                .sessions
                .claim_batch(session_id, batch.batch_id, session.max_processes)
                .await?
            {
                self.spawn_worker(&session, batch);
                running += 1;
                launched += 1;
            }
        }

        if launched > 0 {
            debug!("session {session_id}: launched {launched} batches ({running} running)");
        }

        Ok(launched)
    }

    fn spawn_worker(&self, session: &SessionRow, batch: &BatchRow) {
        let worker = BatchWorker::new(
            self.sessions.clone(),
            Arc::clone(&self.proxies),
            Arc::clone(&self.prober),
            BatchSpec {
                session_id: session.id.clone(),
                batch_id: batch.batch_id,
                start_offset: batch.start_offset,
                limit: batch.slice_limit,
            },
            session.worker_concurrency as usize,
        );

        let sessions = self.sessions.clone();
        let session_id = session.id.clone();
        let batch_id = batch.batch_id;

        tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                warn!("batch {batch_id} of session {session_id} failed: {e}");
                if let Err(e) = sessions.fail_batch(&session_id, batch_id).await {
                    warn!("could not record failure of batch {batch_id}: {e}");
                }
            }
        });
    }

    fn spawn_supervisor(&self, session_id: String, opts: SessionOptions) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.supervise(session_id, opts).await;
        });
    }

    /// Drive one session to a terminal state: refill batches, fail the
    /// stale ones, and enforce the wall-clock cap.
    async fn supervise(&self, session_id: String, opts: SessionOptions) {
        let liveness = chrono::Duration::from_std(opts.liveness_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let deadline = Utc::now()
            + chrono::Duration::from_std(opts.session_deadline)
                .unwrap_or_else(|_| chrono::Duration::hours(1));

        loop {
            tokio::time::sleep(opts.supervisor_interval).await;

            let session = match self.sessions.get_session(&session_id).await {
                Ok(Some(session)) => session,
                Ok(None) => {
                    warn!("session {session_id} disappeared; supervisor exiting");
                    return;
                }
                Err(e) => {
                    warn!("session {session_id}: state store read failed: {e}");
                    continue;
                }
            };

            // Batches whose worker died or hung look exactly the same from
            // here: a running row with a stale heartbeat. Fail them so
            // their concurrency slots free up.
            match self
                .sessions
                .fail_stale_batches(&session_id, Utc::now() - liveness)
                .await
            {
                Ok(swept) if swept > 0 => {
                    warn!("session {session_id}: failed {swept} stale batches");
                }
                Err(e) => warn!("session {session_id}: stale sweep failed: {e}"),
                _ => {}
            }

            if Utc::now() > deadline {
                match self.sessions.fail_unfinished(&session_id).await {
                    Ok(swept) => warn!(
                        "session {session_id}: wall-clock cap hit, failed {swept} unfinished batches"
                    ),
                    Err(e) => warn!("session {session_id}: deadline sweep failed: {e}"),
                }
                return;
            }

            if !session.cancelled {
                if let Err(e) = self.pump(&session_id).await {
                    warn!("session {session_id}: pump failed: {e}");
                }
            }

            match self.sessions.batch_snapshot(&session_id).await {
                Ok(batches) => {
                    let running = batches.iter().filter(|b| b.status.is_running()).count();
                    let pending = batches.iter().filter(|b| b.status.is_pending()).count();
                    // Terminal: nothing running, and nothing pending will
                    // ever start (either none left or the run is cancelled)
                    if running == 0 && (pending == 0 || session.cancelled) {
                        info!("session {session_id}: terminal, supervisor exiting");
                        return;
                    }
                }
                Err(e) => warn!("session {session_id}: snapshot failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::progress::ProgressAggregator;
    use crate::orchestrator::session::BatchStatus;
    use crate::proxy::models::{CheckResult, NewProxy, ProxyScheme, ProxyTarget};
    use crate::store::proxies::SqliteProxyStore;
    use crate::store::Store;
    use async_trait::async_trait;
    use sqlx::SqlitePool;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Probe stub: constant verdict after an optional delay
    struct StubProbe {
        online: bool,
        delay: Duration,
    }

    impl StubProbe {
        fn instant(online: bool) -> Self {
            Self {
                online,
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                online: true,
                delay,
            }
        }
    }

    #[async_trait]
    impl Probe for StubProbe {
        async fn probe(&self, target: &ProxyTarget) -> CheckResult {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.online {
                CheckResult::online(target.id, 5)
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
                .insert(&NewProxy::new(format!("10.0.{}.{}", i / 256, i % 256), 8080, ProxyScheme::Http))
                .await
                .unwrap();
        }
        proxies
    }

    fn fast_opts() -> SessionOptions {
        SessionOptions::full_run()
            .with_batch_size(20)
            .with_max_processes(2)
            .with_worker_concurrency(5)
            .with_supervisor_interval(Duration::from_millis(20))
            .with_liveness_timeout(Duration::from_secs(10))
    }

    async fn wait_finished(aggregator: &ProgressAggregator, session_id: &str) {
        for _ in 0..500 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let view = aggregator.progress(session_id).await.unwrap();
            if view.is_finished {
                return;
            }
        }
        panic!("session {session_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn test_full_run_43_proxies() {
        let (_dir, pool) = test_pool().await;
        let proxies = seed(&pool, 43).await;
        let sessions = SessionStore::new(pool.clone());
        let scheduler = Scheduler::new(
            sessions.clone(),
            proxies,
            Arc::new(StubProbe::instant(true)),
        );
        let aggregator = ProgressAggregator::new(sessions);

        let outcome = scheduler.start(fast_opts()).await.unwrap();
        assert_eq!(outcome.total_proxies, 43);
        assert_eq!(outcome.total_batches, 3);
        let session_id = outcome.session_id.unwrap();

        wait_finished(&aggregator, &session_id).await;

        let view = aggregator.progress(&session_id).await.unwrap();
        assert!(view.is_complete);
        assert_eq!(view.completed_batches, 3);
        assert_eq!(view.active_batches, 0);
        assert_eq!(view.total_checked, 43);
        assert_eq!(view.total_online, 43);
        assert_eq!(view.overall_progress, 100);
    }

    #[tokio::test]
    async fn test_start_with_no_proxies() {
        let (_dir, pool) = test_pool().await;
        let proxies = seed(&pool, 0).await;
        let sessions = SessionStore::new(pool.clone());
        let scheduler = Scheduler::new(sessions, proxies, Arc::new(StubProbe::instant(true)));

        let outcome = scheduler.start(fast_opts()).await.unwrap();
        assert!(outcome.session_id.is_none());
        assert_eq!(outcome.total_proxies, 0);
        assert_eq!(outcome.total_batches, 0);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_options() {
        let (_dir, pool) = test_pool().await;
        let proxies = seed(&pool, 5).await;
        let sessions = SessionStore::new(pool.clone());
        let scheduler = Scheduler::new(sessions, proxies, Arc::new(StubProbe::instant(true)));

        let err = scheduler
            .start(fast_opts().with_batch_size(0))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_occupancy_never_exceeds_cap() {
        let (_dir, pool) = test_pool().await;
        let proxies = seed(&pool, 50).await;
        let sessions = SessionStore::new(pool.clone());
        let scheduler = Scheduler::new(
            sessions.clone(),
            proxies,
            Arc::new(StubProbe::slow(Duration::from_millis(30))),
        );
        let aggregator = ProgressAggregator::new(sessions);

        let outcome = scheduler
            .start(fast_opts().with_batch_size(10).with_max_processes(2))
            .await
            .unwrap();
        assert_eq!(outcome.total_batches, 5);
        let session_id = outcome.session_id.unwrap();

        loop {
            let view = aggregator.progress(&session_id).await.unwrap();
            assert!(view.active_batches <= 2, "cap exceeded: {view:?}");
            if view.is_finished {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let view = aggregator.progress(&session_id).await.unwrap();
        assert!(view.is_complete);
        assert_eq!(view.completed_batches, 5);
        assert_eq!(view.total_checked, 50);
    }

    #[tokio::test]
    async fn test_cancel_leaves_pending_batches_unstarted() {
        let (_dir, pool) = test_pool().await;
        let proxies = seed(&pool, 60).await;
        let sessions = SessionStore::new(pool.clone());
        let scheduler = Scheduler::new(
            sessions.clone(),
            proxies,
            Arc::new(StubProbe::slow(Duration::from_millis(20))),
        );
        let aggregator = ProgressAggregator::new(sessions.clone());

        // Cap 1 so batches 1 and 2 are still pending at cancel time
        let outcome = scheduler
            .start(fast_opts().with_batch_size(20).with_max_processes(1))
            .await
            .unwrap();
        let session_id = outcome.session_id.unwrap();

        sessions.set_cancelled(&session_id).await.unwrap();
        wait_finished(&aggregator, &session_id).await;

        let view = aggregator.progress(&session_id).await.unwrap();
        assert!(view.cancelled);
        assert_eq!(view.active_batches, 0);
        // Never-started batches stay pending forever; completed plus
        // never-started covers the whole plan
        let pending = view
            .batch_statuses
            .iter()
            .filter(|b| b.status == BatchStatus::Pending)
            .count() as u32;
        assert_eq!(view.completed_batches + pending, view.total_batches);
        assert!(pending >= 1);
        assert!(view.is_finished);
        assert!(!view.is_complete);
    }

    #[tokio::test]
    async fn test_stale_batch_is_failed_and_run_still_finishes() {
        let (_dir, pool) = test_pool().await;
        let proxies = seed(&pool, 30).await;
        let sessions = SessionStore::new(pool.clone());
        let scheduler = Scheduler::new(
            sessions.clone(),
            proxies,
            Arc::new(StubProbe::slow(Duration::from_millis(10))),
        );
        let aggregator = ProgressAggregator::new(sessions.clone());

        let outcome = scheduler
            .start(
                fast_opts()
                    .with_batch_size(10)
                    .with_max_processes(1)
                    .with_liveness_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        let session_id = outcome.session_id.unwrap();

        // Simulate a crashed worker: claim batch 2 out from under the
        // scheduler so no worker will ever heartbeat it. Batch 0 is still
        // mid-probe, so batch 2 is guaranteed to still be pending here.
        assert!(sessions.claim_batch(&session_id, 2, 10).await.unwrap());

        wait_finished(&aggregator, &session_id).await;

        let view = aggregator.progress(&session_id).await.unwrap();
        assert!(view.is_finished);
        assert!(!view.is_complete);
        assert_eq!(view.failed_batches, 1);
        assert_eq!(view.completed_batches, 2);
    }

    #[tokio::test]
    async fn test_two_sessions_run_concurrently() {
        let (_dir, pool) = test_pool().await;
        let proxies = seed(&pool, 25).await;
        let sessions = SessionStore::new(pool.clone());
        let scheduler = Scheduler::new(
            sessions.clone(),
            proxies,
            Arc::new(StubProbe::slow(Duration::from_millis(5))),
        );
        let aggregator = ProgressAggregator::new(sessions);

        let first = scheduler.start(fast_opts().with_batch_size(10)).await.unwrap();
        let second = scheduler.start(fast_opts().with_batch_size(5)).await.unwrap();
        let first_id = first.session_id.unwrap();
        let second_id = second.session_id.unwrap();
        assert_ne!(first_id, second_id);

        wait_finished(&aggregator, &first_id).await;
        wait_finished(&aggregator, &second_id).await;

        let first = aggregator.progress(&first_id).await.unwrap();
        let second = aggregator.progress(&second_id).await.unwrap();
        assert!(first.is_complete && second.is_complete);
        assert_eq!(first.total_checked, 25);
        assert_eq!(second.total_checked, 25);
        assert_eq!(first.total_batches, 3);
        assert_eq!(second.total_batches, 5);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let (_dir, pool) = test_pool().await;
        let proxies = seed(&pool, 40).await;
        let sessions = SessionStore::new(pool.clone());
        let scheduler = Scheduler::new(
            sessions.clone(),
            proxies,
            Arc::new(StubProbe::slow(Duration::from_millis(5))),
        );
        let aggregator = ProgressAggregator::new(sessions);

        let outcome = scheduler
            .start(fast_opts().with_batch_size(10))
            .await
            .unwrap();
        let session_id = outcome.session_id.unwrap();

        let mut last_checked = 0;
        let mut last_online = 0;
        loop {
            let view = aggregator.progress(&session_id).await.unwrap();
            assert!(view.total_checked >= last_checked);
            assert!(view.total_online >= last_online);
            last_checked = view.total_checked;
            last_online = view.total_online;
            if view.is_finished {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(last_checked, 40);
    }
}
