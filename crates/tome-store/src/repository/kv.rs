//! # SQLite Key-Value Repository
//!
//! `kv_entries` access for the sync engine's persisted state.
//!
//! ## Atomic Replace
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   SINGLE TRANSACTION                                    │
//! │                                                                         │
//! │  INSERT INTO kv_entries (key, value, updated_at) VALUES (?, ?, ?)       │
//! │  ON CONFLICT(key) DO UPDATE SET value = excluded.value, ...            │
//! │                                                                         │
//! │  COMMIT ← readers see the old snapshot or the new one, never a mix     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::repository::KvStore;

/// One stored row, as listed by [`SqliteKvStore::entries`].
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    /// RFC 3339 time of the last write.
    pub updated_at: String,
}

/// Repository for the `kv_entries` table.
#[derive(Debug, Clone)]
pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    /// Creates a new SqliteKvStore.
    pub fn new(pool: SqlitePool) -> Self {
        SqliteKvStore { pool }
    }

    /// Lists every stored row, ordered by key.
    pub async fn entries(&self) -> StoreResult<Vec<KvEntry>> {
        let rows = sqlx::query_as::<_, KvEntry>(
            "SELECT key, value, updated_at FROM kv_entries ORDER BY key",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM kv_entries WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value)
    }

    async fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        let now = Utc::now().to_rfc3339();

        debug!(key = %key, bytes = value.len(), "Writing store entry");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        debug!(key = %key, "Deleting store entry");

        sqlx::query("DELETE FROM kv_entries WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        let keys: Vec<String> = sqlx::query_scalar("SELECT key FROM kv_entries ORDER BY key")
            .fetch_all(&self.pool)
            .await?;

        Ok(keys)
    }
}
