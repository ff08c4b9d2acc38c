//! Request/response surface over the orchestrator
//!
//! Every call returns a structured payload with a `success` flag; errors
//! are folded into the payload so a poller always gets a determinate
//! response, whatever state the underlying batches are in.

use crate::orchestrator::control::CancellationController;
use crate::orchestrator::progress::{ProgressAggregator, ProgressView};
use crate::orchestrator::scheduler::Scheduler;
use crate::orchestrator::session::SessionOptions;
use crate::orchestrator::OrchestratorError;
use crate::proxy::prober::Probe;
use crate::store::proxies::SqliteProxyStore;
use crate::store::sessions::SessionStore;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

/// Response to a start request
#[derive(Debug, Clone, Serialize)]
pub struct StartReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub total_proxies: u64,
    pub total_batches: u32,
    pub batch_size: u32,
    pub max_processes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response to a progress poll
#[derive(Debug, Clone, Serialize)]
pub struct ProgressReply {
    pub success: bool,
    #[serde(flatten)]
    pub progress: Option<ProgressView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response to a cancel request
#[derive(Debug, Clone, Serialize)]
pub struct CancelReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The start/progress/cancel surface, transport-agnostic
#[derive(Clone)]
pub struct Api {
    scheduler: Scheduler,
    aggregator: ProgressAggregator,
    control: CancellationController,
}

impl Api {
    pub fn new(pool: SqlitePool, prober: Arc<dyn Probe>) -> Self {
        let sessions = SessionStore::new(pool.clone());
        let proxies = Arc::new(SqliteProxyStore::new(pool));

        Self {
            scheduler: Scheduler::new(sessions.clone(), proxies, prober),
            aggregator: ProgressAggregator::new(sessions.clone()),
            control: CancellationController::new(sessions),
        }
    }

    pub async fn start(&self, opts: SessionOptions) -> StartReply {
        match self.scheduler.start(opts.clone()).await {
            Ok(outcome) => StartReply {
                success: true,
                session_id: outcome.session_id,
                total_proxies: outcome.total_proxies,
                total_batches: outcome.total_batches,
                batch_size: outcome.batch_size,
                max_processes: outcome.max_processes,
                error: None,
            },
            Err(e) => StartReply {
                success: false,
                session_id: None,
                total_proxies: 0,
                total_batches: 0,
                batch_size: opts.batch_size,
                max_processes: opts.max_processes,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn progress(&self, session_id: &str) -> ProgressReply {
        // Each poll also nudges the scheduler, so a run keeps moving even
        // if its supervisor task is gone; the claim discipline makes the
        // extra pump harmless.
        match self.scheduler.pump(session_id).await {
            Ok(_) => {}
            Err(OrchestratorError::NotFound(_)) => {}
            Err(e) => debug!("pump on poll failed for {session_id}: {e}"),
        }

        match self.aggregator.progress(session_id).await {
            Ok(view) => ProgressReply {
                success: true,
                progress: Some(view),
                error: None,
            },
            Err(e) => ProgressReply {
                success: false,
                progress: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn cancel(&self, session_id: &str) -> CancelReply {
        match self.control.cancel(session_id).await {
            Ok(()) => CancelReply {
                success: true,
                error: None,
            },
            Err(e) => CancelReply {
                success: false,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::{CheckResult, NewProxy, ProxyScheme, ProxyTarget};
    use crate::store::Store;
    use async_trait::async_trait;
    use std::time::Duration;

    struct AlwaysOnline;

    #[async_trait]
    impl Probe for AlwaysOnline {
        async fn probe(&self, target: &ProxyTarget) -> CheckResult {
            CheckResult::online(target.id, 1)
        }
    }

    async fn api_with_proxies(n: usize) -> (tempfile::TempDir, Api) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(path.to_str().unwrap()).await.unwrap();
        store.migrate().await.unwrap();

        let proxies = SqliteProxyStore::new(store.pool().clone());
        for i in 0..n {
            proxies
                .insert(&NewProxy::new(format!("10.0.0.{i}"), 8080, ProxyScheme::Http))
                .await
                .unwrap();
        }

        (dir, Api::new(store.pool().clone(), Arc::new(AlwaysOnline)))
    }

    fn fast_opts() -> SessionOptions {
        SessionOptions::full_run()
            .with_batch_size(5)
            .with_max_processes(2)
            .with_supervisor_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_start_progress_cancel_round_trip() {
        let (_dir, api) = api_with_proxies(12).await;

        let started = api.start(fast_opts()).await;
        assert!(started.success);
        assert_eq!(started.total_proxies, 12);
        assert_eq!(started.total_batches, 3);
        let session_id = started.session_id.clone().unwrap();

        let mut finished = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let reply = api.progress(&session_id).await;
            assert!(reply.success);
            if reply.progress.as_ref().unwrap().is_finished {
                finished = true;
                break;
            }
        }
        assert!(finished);

        let cancelled = api.cancel(&session_id).await;
        assert!(cancelled.success);
    }

    #[tokio::test]
    async fn test_start_with_nothing_to_do() {
        let (_dir, api) = api_with_proxies(0).await;

        let started = api.start(fast_opts()).await;
        assert!(started.success);
        assert!(started.session_id.is_none());
        assert_eq!(started.total_batches, 0);
    }

    #[tokio::test]
    async fn test_unknown_session_yields_error_payloads() {
        let (_dir, api) = api_with_proxies(3).await;

        let reply = api.progress("no-such-session").await;
        assert!(!reply.success);
        assert!(reply.error.unwrap().contains("unknown session"));

        let reply = api.cancel("no-such-session").await;
        assert!(!reply.success);
        assert!(reply.error.is_some());
    }

    #[tokio::test]
    async fn test_invalid_options_fail_start() {
        let (_dir, api) = api_with_proxies(3).await;

        let reply = api.start(fast_opts().with_max_processes(0)).await;
        assert!(!reply.success);
        assert!(reply.error.unwrap().contains("invalid argument"));
    }

    #[tokio::test]
    async fn test_replies_serialize_with_success_flag() {
        let (_dir, api) = api_with_proxies(0).await;

        let started = api.start(fast_opts()).await;
        let json = serde_json::to_value(&started).unwrap();
        assert_eq!(json["success"], true);
        assert!(json.get("session_id").is_none());
        assert!(json.get("error").is_none());
    }
}
