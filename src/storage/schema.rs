use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations.
    ///
    /// `:memory:` opens a single-connection pool so every query sees the same
    /// in-memory database (each SQLite connection would otherwise get its own).
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Locked` if the file is held by another process
    /// (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Other` for other database errors.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: the three adapters write concurrently, SQLite waits
        // up to 5 seconds for the write lock before returning SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000");

        let mut pool_options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(10));
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("database table is locked")
            {
                DatabaseError::Locked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Create the tables this crate reads and writes.
    ///
    /// Production deployments usually own these tables elsewhere; every
    /// statement is `IF NOT EXISTS` so running against such a database is a
    /// no-op. All statements run in one transaction.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Feed registry (written by the operator command layer, read here)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notification_feeds (
                id INTEGER PRIMARY KEY,
                guild_id TEXT NOT NULL,
                source_reference TEXT NOT NULL,
                delivery_target TEXT NOT NULL,
                kind_filter TEXT NOT NULL DEFAULT 'any',
                is_enabled INTEGER NOT NULL DEFAULT 1,
                template_json TEXT,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_feeds_enabled ON notification_feeds(is_enabled)",
        )
        .execute(&mut *tx)
        .await?;

        // Dedup ledger: one row per (source, content), the primary key is the claim
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dedup_ledger (
                source_id TEXT NOT NULL,
                content_id TEXT NOT NULL,
                classification TEXT NOT NULL,
                delivered_at INTEGER NOT NULL,
                PRIMARY KEY (source_id, content_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ledger_delivered ON dedup_ledger(delivered_at)",
        )
        .execute(&mut *tx)
        .await?;

        // Push intake queue (appended by the webhook receiver)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS intake_events (
                id INTEGER PRIMARY KEY,
                content_id TEXT UNIQUE NOT NULL,
                source_id TEXT NOT NULL,
                title TEXT NOT NULL,
                channel_name TEXT NOT NULL,
                event_type TEXT NOT NULL DEFAULT 'none',
                published_at INTEGER,
                received_at INTEGER NOT NULL,
                is_processed INTEGER NOT NULL DEFAULT 0,
                processed_at INTEGER
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Partial index: the drain query only ever looks at unprocessed rows
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_intake_pending ON intake_events(received_at) WHERE is_processed = 0",
        )
        .execute(&mut *tx)
        .await?;

        // Push subscription leases
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                source_id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'pending',
                expires_at INTEGER,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_attempt_at INTEGER,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Newest syndication entry seen per source
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS poll_cursors (
                source_id TEXT PRIMARY KEY,
                last_content_id TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
