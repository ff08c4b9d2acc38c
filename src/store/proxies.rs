//! Persistent proxy store: the records the dashboard displays and the
//! target source the orchestrator slices into batches

use crate::proxy::models::{
    CheckResult, NewProxy, ProxyAuth, ProxyRecord, ProxyScheme, ProxyStatus, ProxyTarget,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

/// Target source and result sink for the check orchestrator.
///
/// `snapshot_targets` freezes the (optionally offline-only) target set for a
/// session; batch slices are then stable no matter how statuses change while
/// the run is in flight.
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Number of proxies a new run over this filter would cover
    async fn count(&self, offline_only: bool) -> Result<u64, sqlx::Error>;

    /// Freeze the ordered target set for a session; returns its size
    async fn snapshot_targets(
        &self,
        session_id: &str,
        offline_only: bool,
    ) -> Result<u64, sqlx::Error>;

    /// Fetch one contiguous slice of a frozen target set
    async fn fetch_batch(
        &self,
        session_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ProxyTarget>, sqlx::Error>;

    /// Persist one probe outcome
    async fn record_result(&self, result: &CheckResult) -> Result<(), sqlx::Error>;
}

/// SQLite implementation of the proxy store
#[derive(Clone)]
pub struct SqliteProxyStore {
    pool: SqlitePool,
}

impl SqliteProxyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<ProxyRecord, sqlx::Error> {
        let scheme: String = row.try_get("scheme")?;
        let status: String = row.try_get("status")?;

        let username: Option<String> = row.try_get("username")?;
        let password: Option<String> = row.try_get("password")?;
        let auth = match (username, password) {
            (Some(username), Some(password)) => Some(ProxyAuth::new(username, password)),
            _ => None,
        };

        Ok(ProxyRecord {
            id: row.try_get("id")?,
            host: row.try_get("host")?,
            port: row.try_get::<i64, _>("port")? as u16,
            scheme: ProxyScheme::parse(&scheme).unwrap_or_default(),
            auth,
            status: ProxyStatus::parse(&status),
            response_time_ms: row
                .try_get::<Option<i64>, _>("response_time_ms")?
                .map(|ms| ms as u64),
            last_error: row.try_get("last_error")?,
            consecutive_failures: row.try_get::<i64, _>("consecutive_failures")? as u32,
            country_code: row.try_get("country_code")?,
            last_checked_at: row.try_get("last_checked_at")?,
        })
    }

    /// Insert a proxy; duplicates (same host/port/scheme) are skipped.
    /// Returns true when a row was actually inserted.
    pub async fn insert(&self, proxy: &NewProxy) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r"
            INSERT INTO proxies (host, port, scheme, username, password)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (host, port, scheme) DO NOTHING
            ",
        )
        .bind(&proxy.host)
        .bind(proxy.port as i64)
        .bind(proxy.scheme.as_str())
        .bind(proxy.auth.as_ref().map(|a| a.username.as_str()))
        .bind(proxy.auth.as_ref().map(|a| a.password.as_str()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Bulk insert; returns how many new rows were added
    pub async fn import(&self, proxies: &[NewProxy]) -> Result<u64, sqlx::Error> {
        let mut added = 0;
        for proxy in proxies {
            if self.insert(proxy).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub async fn get(&self, id: i64) -> Result<Option<ProxyRecord>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM proxies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| Self::row_to_record(&row)).transpose()
    }

    /// All proxies, optionally restricted by status, newest last
    pub async fn list(&self, status: Option<ProxyStatus>) -> Result<Vec<ProxyRecord>, sqlx::Error> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM proxies WHERE status = ? ORDER BY id")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM proxies ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(Self::row_to_record).collect()
    }

    /// Annotate a proxy with its looked-up location
    pub async fn set_country(&self, id: i64, country_code: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE proxies SET country_code = ? WHERE id = ?")
            .bind(country_code)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Proxies that have failed at least `threshold` checks in a row.
    /// This is the input the alerting pipeline consumes.
    pub async fn failing_consecutively(
        &self,
        threshold: u32,
    ) -> Result<Vec<ProxyRecord>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM proxies WHERE consecutive_failures >= ? ORDER BY consecutive_failures DESC",
        )
        .bind(threshold as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }
}

#[async_trait]
impl ProxyStore for SqliteProxyStore {
    async fn count(&self, offline_only: bool) -> Result<u64, sqlx::Error> {
        let row = if offline_only {
            sqlx::query("SELECT COUNT(*) AS n FROM proxies WHERE status = 'offline'")
                .fetch_one(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT COUNT(*) AS n FROM proxies")
                .fetch_one(&self.pool)
                .await?
        };

        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    async fn snapshot_targets(
        &self,
        session_id: &str,
        offline_only: bool,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            INSERT INTO check_targets (session_id, seq, proxy_id)
            SELECT ?, ROW_NUMBER() OVER (ORDER BY id) - 1, id
            FROM proxies
            WHERE (? = 0 OR status = 'offline')
            ",
        )
        .bind(session_id)
        .bind(offline_only as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn fetch_batch(
        &self,
        session_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ProxyTarget>, sqlx::Error> {
        let rows = sqlx::query(
            r"
            SELECT p.id, p.host, p.port, p.scheme, p.username, p.password
            FROM check_targets t
            JOIN proxies p ON p.id = t.proxy_id
            WHERE t.session_id = ? AND t.seq >= ? AND t.seq < ?
            ORDER BY t.seq
            ",
        )
        .bind(session_id)
        .bind(offset as i64)
        .bind((offset + limit) as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut targets = Vec::with_capacity(rows.len());
        for row in rows {
            let scheme: String = row.try_get("scheme")?;
            let username: Option<String> = row.try_get("username")?;
            let password: Option<String> = row.try_get("password")?;
            let auth = match (username, password) {
                (Some(username), Some(password)) => Some(ProxyAuth::new(username, password)),
                _ => None,
            };

            targets.push(ProxyTarget {
                id: row.try_get("id")?,
                host: row.try_get("host")?,
                port: row.try_get::<i64, _>("port")? as u16,
                scheme: ProxyScheme::parse(&scheme).unwrap_or_default(),
                auth,
            });
        }

        Ok(targets)
    }

    async fn record_result(&self, result: &CheckResult) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            UPDATE proxies
            SET status = ?,
                response_time_ms = ?,
                last_error = ?,
                last_checked_at = ?,
                consecutive_failures = CASE WHEN ? THEN 0 ELSE consecutive_failures + 1 END
            WHERE id = ?
            ",
        )
        .bind(result.status.as_str())
        .bind(result.response_time_ms.map(|ms| ms as i64))
        .bind(result.error.as_deref())
        .bind(Utc::now())
        .bind(result.is_online())
        .bind(result.proxy_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
