// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite checkpoint store.
//!
//! Keeps the resume checkpoints for one or more watches in a local SQLite
//! database. Records are keyed by `(watch_id, token)`, so several watches
//! (different collections or suffixes) can share one file.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Every statement goes through [`execute_with_retry`]:
//! - exponential backoff starting at 10ms, capped at 500ms
//! - at most 5 attempts, then the error is returned to the watch loop
//!
//! Unlike a debounced cursor, nothing is cached: the watch loop needs
//! `save()` to be durable before it deletes the previous checkpoint.
//!
//! ## Durability
//!
//! WAL journal with `synchronous=NORMAL`. A crash may lose the last
//! committed transaction on power loss but never corrupts the file, and a
//! lost save only means the previous checkpoint is still in place.

use super::CheckpointStore;
use crate::error::{BoxFuture, Result, WatchError};
use crate::event::{CheckpointRecord, OperationType, ResumeToken, Timestamp};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

type CheckpointRow = (String, i64, i64, String, Option<String>, bool);

fn row_to_record(row: CheckpointRow) -> Result<CheckpointRecord> {
    let (token, ts_time, ts_inc, op, doc, delivered) = row;
    let operation_type = OperationType::from_str(&op)
        .map_err(|e| WatchError::checkpoint("decode", e))?;
    let full_document = doc.map(|d| serde_json::from_str(&d)).transpose()?;
    Ok(CheckpointRecord {
        id: ResumeToken::new(token),
        timestamp: Timestamp::new(ts_time as u32, ts_inc as u32),
        operation_type,
        full_document,
        delivered,
    })
}

/// Checkpoint store backed by SQLite. Clones share the pool.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    watch_id: String,
    path: String,
}

impl SqliteCheckpointStore {
    /// Open (or create) the store at `path` for the given watch.
    pub async fn new(path: impl AsRef<Path>, watch_id: impl Into<String>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let watch_id = watch_id.into();
        info!(path = %path_str, watch_id = %watch_id, "Initializing checkpoint store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| WatchError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        Self::init(pool, watch_id, path_str).await
    }

    /// Non-durable store on a private in-memory database.
    pub async fn in_memory(watch_id: impl Into<String>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| WatchError::Config(format!("Invalid SQLite path: {}", e)))?;

        // Every connection gets its own in-memory database, so pin to one
        // connection that never expires.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::init(pool, watch_id.into(), ":memory:".to_string()).await
    }

    async fn init(pool: SqlitePool, watch_id: String, path: String) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                watch_id TEXT NOT NULL,
                token TEXT NOT NULL,
                ts_time INTEGER NOT NULL,
                ts_inc INTEGER NOT NULL,
                operation_type TEXT NOT NULL,
                full_document TEXT,
                delivered INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (watch_id, token)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_ts ON checkpoints (watch_id, ts_time, ts_inc)",
        )
        .execute(&pool)
        .await?;

        let store = Self {
            pool,
            watch_id,
            path,
        };

        let existing = store.count_rows().await?;
        if existing > 0 {
            info!(watch_id = %store.watch_id, count = existing, "Found checkpoints from previous run");
        }

        Ok(store)
    }

    /// Watch this store's records belong to.
    pub fn watch_id(&self) -> &str {
        &self.watch_id
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn count_rows(&self) -> Result<u64> {
        let pool = &self.pool;
        let watch_id = &self.watch_id;
        let (n,): (i64,) = execute_with_retry("checkpoint_count", || async move {
            sqlx::query_as("SELECT COUNT(*) FROM checkpoints WHERE watch_id = ?")
                .bind(watch_id)
                .fetch_one(pool)
                .await
        })
        .await?;
        Ok(n.max(0) as u64)
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("checkpoint_wal", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the connection pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(watch_id = %self.watch_id, "Checkpoint store closed");
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn get_last(&self) -> BoxFuture<'_, Option<CheckpointRecord>> {
        Box::pin(async move {
            let pool = &self.pool;
            let watch_id = &self.watch_id;
            let row: Option<CheckpointRow> = execute_with_retry("checkpoint_get_last", || async move {
                sqlx::query_as(
                    r#"
                    SELECT token, ts_time, ts_inc, operation_type, full_document, delivered
                    FROM checkpoints
                    WHERE watch_id = ?
                    ORDER BY ts_time DESC, ts_inc DESC
                    LIMIT 1
                    "#,
                )
                .bind(watch_id)
                .fetch_optional(pool)
                .await
            })
            .await?;

            row.map(row_to_record).transpose()
        })
    }

    fn save(&self, record: CheckpointRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let pool = &self.pool;
            let watch_id = &self.watch_id;
            let doc = record
                .full_document
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let now = chrono::Utc::now().timestamp_millis();
            let record = &record;
            let doc = &doc;

            execute_with_retry("checkpoint_save", || async move {
                sqlx::query(
                    r#"
                    INSERT INTO checkpoints
                        (watch_id, token, ts_time, ts_inc, operation_type, full_document, delivered, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(watch_id, token) DO UPDATE SET
                        ts_time = excluded.ts_time,
                        ts_inc = excluded.ts_inc,
                        operation_type = excluded.operation_type,
                        full_document = excluded.full_document,
                        delivered = excluded.delivered,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(watch_id)
                .bind(record.id.as_str())
                .bind(i64::from(record.timestamp.time))
                .bind(i64::from(record.timestamp.increment))
                .bind(record.operation_type.as_str())
                .bind(doc.as_deref())
                .bind(record.delivered)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;

            debug!(
                watch_id = %self.watch_id,
                token = %record.id,
                delivered = record.delivered,
                "Checkpoint saved"
            );
            Ok(())
        })
    }

    fn delete(&self, token: &ResumeToken) -> BoxFuture<'_, ()> {
        let token = token.clone();
        Box::pin(async move {
            let pool = &self.pool;
            let watch_id = &self.watch_id;
            let token = &token;

            execute_with_retry("checkpoint_delete", || async move {
                sqlx::query("DELETE FROM checkpoints WHERE watch_id = ? AND token = ?")
                    .bind(watch_id)
                    .bind(token.as_str())
                    .execute(pool)
                    .await
            })
            .await?;

            debug!(watch_id = %self.watch_id, token = %token, "Checkpoint deleted");
            Ok(())
        })
    }

    fn count(&self) -> BoxFuture<'_, u64> {
        Box::pin(self.count_rows())
    }

    fn fetch_all(&self) -> BoxFuture<'_, Vec<CheckpointRecord>> {
        Box::pin(async move {
            let pool = &self.pool;
            let watch_id = &self.watch_id;
            let rows: Vec<CheckpointRow> = execute_with_retry("checkpoint_fetch_all", || async move {
                sqlx::query_as(
                    r#"
                    SELECT token, ts_time, ts_inc, operation_type, full_document, delivered
                    FROM checkpoints
                    WHERE watch_id = ?
                    ORDER BY ts_time ASC, ts_inc ASC
                    "#,
                )
                .bind(watch_id)
                .fetch_all(pool)
                .await
            })
            .await?;

            rows.into_iter().map(row_to_record).collect()
        })
    }
}
