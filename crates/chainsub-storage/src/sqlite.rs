//! SQLite storage backend.
//!
//! Persists the cursor, fork journal, and document collections to a single
//! SQLite file. Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use chainsub_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./chainsub.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainsub_core::cursor::{Cursor, CursorStore};
use chainsub_core::error::SubscribeError;
use chainsub_core::journal::{ChangeRecord, JournalEntry, JournalStore};
use chainsub_core::replay::DocumentStore;

/// SQLite-backed storage for the cursor, journal, and documents.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./chainsub.db"`) or a full
    /// SQLite URL (`"sqlite:./chainsub.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, SubscribeError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| SubscribeError::Storage(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Pinned to a single connection — every pooled connection would
    /// otherwise get its own private `:memory:` database. All data is lost
    /// when the pool is dropped.
    pub async fn in_memory() -> Result<Self, SubscribeError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| SubscribeError::Storage(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), SubscribeError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(|e| SubscribeError::Storage(e.to_string()))?;

        // Singleton cursor row
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cursor (
                id                  INTEGER PRIMARY KEY CHECK (id = 0),
                last_block_num      INTEGER NOT NULL,
                last_block_sequence INTEGER NOT NULL,
                node_id             TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SubscribeError::Storage(e.to_string()))?;

        // One journal row per reversible block
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS journal (
                block_num      INTEGER PRIMARY KEY,
                block_time     TEXT    NOT NULL,
                block_sequence INTEGER NOT NULL,
                finalized      INTEGER NOT NULL,
                stack_json     TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SubscribeError::Storage(e.to_string()))?;

        // Application documents (rollback target)
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                collection  TEXT NOT NULL,
                document_id TEXT NOT NULL,
                body_json   TEXT NOT NULL,
                PRIMARY KEY (collection, document_id)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SubscribeError::Storage(e.to_string()))?;

        Ok(())
    }

    fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<JournalEntry, SubscribeError> {
        let time_str: String = row.get("block_time");
        let block_time: DateTime<Utc> = time_str
            .parse()
            .map_err(|e| SubscribeError::Storage(format!("bad block_time: {e}")))?;

        let stack_str: String = row.get("stack_json");
        let stack: Vec<ChangeRecord> = serde_json::from_str(&stack_str)
            .map_err(|e| SubscribeError::Storage(format!("bad journal stack: {e}")))?;

        Ok(JournalEntry {
            block_num: row.get::<i64, _>("block_num") as u64,
            block_time,
            block_sequence: row.get::<i64, _>("block_sequence") as u64,
            finalized: row.get::<i64, _>("finalized") != 0,
            stack,
        })
    }
}

#[async_trait]
impl CursorStore for SqliteStorage {
    async fn load(&self) -> Result<Option<Cursor>, SubscribeError> {
        let row = sqlx::query(
            "SELECT last_block_num, last_block_sequence, node_id FROM cursor WHERE id = 0",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SubscribeError::Storage(e.to_string()))?;

        Ok(row.map(|r| Cursor {
            last_block_num: r.get::<i64, _>("last_block_num") as u64,
            last_block_sequence: r.get::<i64, _>("last_block_sequence") as u64,
            node_id: r.get("node_id"),
        }))
    }

    async fn save(&self, cursor: &Cursor) -> Result<(), SubscribeError> {
        sqlx::query(
            "INSERT OR REPLACE INTO cursor (id, last_block_num, last_block_sequence, node_id)
             VALUES (0, ?, ?, ?)",
        )
        .bind(cursor.last_block_num as i64)
        .bind(cursor.last_block_sequence as i64)
        .bind(&cursor.node_id)
        .execute(&self.pool)
        .await
        .map_err(|e| SubscribeError::Storage(e.to_string()))?;

        debug!(
            block_num = cursor.last_block_num,
            sequence = cursor.last_block_sequence,
            "cursor saved"
        );
        Ok(())
    }
}

#[async_trait]
impl JournalStore for SqliteStorage {
    async fn insert_entry(&self, entry: JournalEntry) -> Result<(), SubscribeError> {
        let stack = serde_json::to_string(&entry.stack)
            .map_err(|e| SubscribeError::Storage(e.to_string()))?;

        sqlx::query(
            "INSERT OR REPLACE INTO journal
                 (block_num, block_time, block_sequence, finalized, stack_json)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.block_num as i64)
        .bind(entry.block_time.to_rfc3339())
        .bind(entry.block_sequence as i64)
        .bind(entry.finalized as i64)
        .bind(&stack)
        .execute(&self.pool)
        .await
        .map_err(|e| SubscribeError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn push_change(
        &self,
        block_num: u64,
        change: ChangeRecord,
    ) -> Result<(), SubscribeError> {
        let row = sqlx::query("SELECT stack_json FROM journal WHERE block_num = ?")
            .bind(block_num as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SubscribeError::Storage(e.to_string()))?
            .ok_or_else(|| SubscribeError::Storage(format!("no journal entry at {block_num}")))?;

        let stack_str: String = row.get("stack_json");
        let mut stack: Vec<ChangeRecord> = serde_json::from_str(&stack_str)
            .map_err(|e| SubscribeError::Storage(format!("bad journal stack: {e}")))?;
        stack.push(change);
        let stack = serde_json::to_string(&stack)
            .map_err(|e| SubscribeError::Storage(e.to_string()))?;

        sqlx::query("UPDATE journal SET stack_json = ? WHERE block_num = ?")
            .bind(&stack)
            .bind(block_num as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| SubscribeError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn mark_finalized(&self, block_num: u64) -> Result<(), SubscribeError> {
        sqlx::query("UPDATE journal SET finalized = 1 WHERE block_num = ?")
            .bind(block_num as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| SubscribeError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn entries_at_or_above(&self, base: u64) -> Result<Vec<JournalEntry>, SubscribeError> {
        let rows = sqlx::query(
            "SELECT block_num, block_time, block_sequence, finalized, stack_json
             FROM journal WHERE block_num >= ? ORDER BY block_num DESC",
        )
        .bind(base as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SubscribeError::Storage(e.to_string()))?;

        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn top_entries(&self, limit: usize) -> Result<Vec<JournalEntry>, SubscribeError> {
        let rows = sqlx::query(
            "SELECT block_num, block_time, block_sequence, finalized, stack_json
             FROM journal ORDER BY block_num DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SubscribeError::Storage(e.to_string()))?;

        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn delete_entry(&self, block_num: u64) -> Result<(), SubscribeError> {
        sqlx::query("DELETE FROM journal WHERE block_num = ?")
            .bind(block_num as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| SubscribeError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete_above(&self, base: u64) -> Result<(), SubscribeError> {
        sqlx::query("DELETE FROM journal WHERE block_num > ?")
            .bind(base as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| SubscribeError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete_below(&self, watermark: u64) -> Result<(), SubscribeError> {
        sqlx::query("DELETE FROM journal WHERE block_num < ?")
            .bind(watermark as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| SubscribeError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStorage {
    async fn delete(&self, collection: &str, id: &str) -> Result<(), SubscribeError> {
        sqlx::query("DELETE FROM documents WHERE collection = ? AND document_id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| SubscribeError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn overwrite(
        &self,
        collection: &str,
        id: &str,
        image: Value,
    ) -> Result<(), SubscribeError> {
        self.insert(collection, id, image).await
    }

    async fn insert(
        &self,
        collection: &str,
        id: &str,
        image: Value,
    ) -> Result<(), SubscribeError> {
        let body = serde_json::to_string(&image)
            .map_err(|e| SubscribeError::Storage(e.to_string()))?;

        sqlx::query(
            "INSERT OR REPLACE INTO documents (collection, document_id, body_json)
             VALUES (?, ?, ?)",
        )
        .bind(collection)
        .bind(id)
        .bind(&body)
        .execute(&self.pool)
        .await
        .map_err(|e| SubscribeError::Storage(e.to_string()))?;
        Ok(())
    }
}
