//! Durable session state for check runs
//!
//! Progress is polled over independent requests, so all session and batch
//! state lives here rather than in any task's memory. Every mutation is a
//! single SQL statement, which is what makes concurrent workers, the
//! scheduler, and progress polls safe against lost updates: counter bumps
//! are relative (`SET x = x + 1`) and status transitions are conditional
//! (`WHERE status = ...`), so the forward-only state machine cannot be
//! raced backwards.

use crate::orchestrator::session::{BatchSlice, BatchStatus};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

/// One check run, fixed at creation apart from the cancellation flag
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub offline_only: bool,
    pub max_processes: u32,
    pub batch_size: u32,
    pub worker_concurrency: u32,
    pub total_proxies: u64,
    pub total_batches: u32,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

/// One batch's durable state
#[derive(Debug, Clone)]
pub struct BatchRow {
    pub session_id: String,
    pub batch_id: u32,
    pub start_offset: u64,
    pub slice_limit: u32,
    pub status: BatchStatus,
    pub checked_count: u64,
    pub online_count: u64,
    pub offline_count: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
}

/// Session state store over SQLite
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Write the session row and its full batch plan (all pending) in one
    /// transaction, so a session is never visible with a partial plan.
    pub async fn create_session(
        &self,
        session: &SessionRow,
        plan: &[BatchSlice],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO check_sessions (
                id, offline_only, max_processes, batch_size, worker_concurrency,
                total_proxies, total_batches, cancelled, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
            ",
        )
        .bind(&session.id)
        .bind(session.offline_only)
        .bind(session.max_processes as i64)
        .bind(session.batch_size as i64)
        .bind(session.worker_concurrency as i64)
        .bind(session.total_proxies as i64)
        .bind(session.total_batches as i64)
        .bind(session.created_at)
        .execute(&mut *tx)
        .await?;

        for slice in plan {
            sqlx::query(
                r"
                INSERT INTO check_batches (session_id, batch_id, start_offset, slice_limit, status)
                VALUES (?, ?, ?, ?, 'pending')
                ",
            )
            .bind(&session.id)
            .bind(slice.batch_id as i64)
            .bind(slice.start_offset as i64)
            .bind(slice.limit as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM check_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(SessionRow {
                id: row.try_get("id")?,
                offline_only: row.try_get("offline_only")?,
                max_processes: row.try_get::<i64, _>("max_processes")? as u32,
                batch_size: row.try_get::<i64, _>("batch_size")? as u32,
                worker_concurrency: row.try_get::<i64, _>("worker_concurrency")? as u32,
                total_proxies: row.try_get::<i64, _>("total_proxies")? as u64,
                total_batches: row.try_get::<i64, _>("total_batches")? as u32,
                cancelled: row.try_get("cancelled")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    /// All batch rows of a session in one SELECT. One read is one
    /// consistent snapshot; completion checks must go through this.
    pub async fn batch_snapshot(&self, session_id: &str) -> Result<Vec<BatchRow>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM check_batches WHERE session_id = ? ORDER BY batch_id")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(BatchRow {
                    session_id: row.try_get("session_id")?,
                    batch_id: row.try_get::<i64, _>("batch_id")? as u32,
                    start_offset: row.try_get::<i64, _>("start_offset")? as u64,
                    slice_limit: row.try_get::<i64, _>("slice_limit")? as u32,
                    status: BatchStatus::parse(&status),
                    checked_count: row.try_get::<i64, _>("checked_count")? as u64,
                    online_count: row.try_get::<i64, _>("online_count")? as u64,
                    offline_count: row.try_get::<i64, _>("offline_count")? as u64,
                    started_at: row.try_get("started_at")?,
                    finished_at: row.try_get("finished_at")?,
                    last_progress_at: row.try_get("last_progress_at")?,
                })
            })
            .collect()
    }

    /// Transition a batch pending -> running, but only while fewer than
    /// `max_processes` batches of the session are running. Returns false
    /// when the batch was already claimed (or is no longer pending) or
    /// the cap is full; the loser must not launch a worker.
    ///
    /// The occupancy guard lives inside the statement so concurrent
    /// pumps cannot both see a free slot and overshoot the cap.
    pub async fn claim_batch(
        &self,
        session_id: &str,
        batch_id: u32,
        max_processes: u32,
    ) -> Result<bool, sqlx::Error> {
        let now = Utc::now();
        let result = sqlx::query(
            r"
            UPDATE check_batches
            SET status = 'running', started_at = ?, last_progress_at = ?
            WHERE session_id = ? AND batch_id = ? AND status = 'pending'
              AND (SELECT COUNT(*) FROM check_batches
                   WHERE session_id = ? AND status = 'running') < ?
            ",
        )
        .bind(now)
        .bind(now)
        .bind(session_id)
        .bind(batch_id as i64)
        .bind(session_id)
        .bind(max_processes as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Count one checked proxy against a batch and refresh its heartbeat
    pub async fn record_batch_progress(
        &self,
        session_id: &str,
        batch_id: u32,
        online: bool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            UPDATE check_batches
            SET checked_count = checked_count + 1,
                online_count = online_count + CASE WHEN ? THEN 1 ELSE 0 END,
                offline_count = offline_count + CASE WHEN ? THEN 0 ELSE 1 END,
                last_progress_at = ?
            WHERE session_id = ? AND batch_id = ?
            ",
        )
        .bind(online)
        .bind(online)
        .bind(Utc::now())
        .bind(session_id)
        .bind(batch_id as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Transition a batch running -> completed
    pub async fn finish_batch(&self, session_id: &str, batch_id: u32) -> Result<bool, sqlx::Error> {
        self.close_batch(session_id, batch_id, BatchStatus::Completed)
            .await
    }

    /// Transition a batch running -> failed
    pub async fn fail_batch(&self, session_id: &str, batch_id: u32) -> Result<bool, sqlx::Error> {
        self.close_batch(session_id, batch_id, BatchStatus::Failed)
            .await
    }

    async fn close_batch(
        &self,
        session_id: &str,
        batch_id: u32,
        status: BatchStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r"
            UPDATE check_batches
            SET status = ?, finished_at = ?
            WHERE session_id = ? AND batch_id = ? AND status = 'running'
            ",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(session_id)
        .bind(batch_id as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Fail every running batch whose heartbeat is older than `cutoff`.
    /// Returns how many were swept.
    pub async fn fail_stale_batches(
        &self,
        session_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            UPDATE check_batches
            SET status = 'failed', finished_at = ?
            WHERE session_id = ? AND status = 'running' AND last_progress_at < ?
            ",
        )
        .bind(Utc::now())
        .bind(session_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Fail everything still pending or running; the wall-clock backstop
    pub async fn fail_unfinished(&self, session_id: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            UPDATE check_batches
            SET status = 'failed', finished_at = ?
            WHERE session_id = ? AND status IN ('pending', 'running')
            ",
        )
        .bind(Utc::now())
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Set the cancellation flag (monotonic, idempotent). Returns false
    /// only when the session does not exist.
    pub async fn set_cancelled(&self, session_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE check_sessions SET cancelled = 1 WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn is_cancelled(&self, session_id: &str) -> Result<Option<bool>, sqlx::Error> {
        let row = sqlx::query("SELECT cancelled FROM check_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row.try_get("cancelled")).transpose()
    }
}
