//! SQLite persistence: proxy records plus durable check-session state

pub mod proxies;
pub mod sessions;

pub use proxies::{ProxyStore, SqliteProxyStore};
pub use sessions::{BatchRow, SessionRow, SessionStore};

use crate::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;

/// Shared database handle for every component
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database at the given path or URL
    pub async fn open(database_url: &str) -> Result<Self> {
        let db_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");

        if !Path::new(db_path).exists() {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::File::create(db_path)?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(&format!("sqlite://{}", db_path))
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the schema if it does not exist yet
    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS proxies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                scheme TEXT NOT NULL DEFAULT 'http',
                username TEXT,
                password TEXT,
                status TEXT NOT NULL DEFAULT 'unchecked',
                response_time_ms INTEGER,
                last_error TEXT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                country_code TEXT,
                last_checked_at DATETIME,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (host, port, scheme)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS check_sessions (
                id TEXT PRIMARY KEY,
                offline_only INTEGER NOT NULL DEFAULT 0,
                max_processes INTEGER NOT NULL,
                batch_size INTEGER NOT NULL,
                worker_concurrency INTEGER NOT NULL DEFAULT 5,
                total_proxies INTEGER NOT NULL,
                total_batches INTEGER NOT NULL,
                cancelled INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS check_batches (
                session_id TEXT NOT NULL,
                batch_id INTEGER NOT NULL,
                start_offset INTEGER NOT NULL,
                slice_limit INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                checked_count INTEGER NOT NULL DEFAULT 0,
                online_count INTEGER NOT NULL DEFAULT 0,
                offline_count INTEGER NOT NULL DEFAULT 0,
                started_at DATETIME,
                finished_at DATETIME,
                last_progress_at DATETIME,
                PRIMARY KEY (session_id, batch_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS check_targets (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                proxy_id INTEGER NOT NULL,
                PRIMARY KEY (session_id, seq)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_proxies_status ON proxies (status)",
            "CREATE INDEX IF NOT EXISTS idx_batches_status ON check_batches (session_id, status)",
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_and_migrate() -> Result<()> {
        let dir = tempdir()?;
        let db_path = dir.path().join("test.db");

        let store = Store::open(db_path.to_str().unwrap()).await?;
        store.migrate().await?;
        // Re-running migrations is a no-op
        store.migrate().await?;

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM proxies")
            .fetch_one(store.pool())
            .await?;
        assert_eq!(count.0, 0);

        Ok(())
    }
}
