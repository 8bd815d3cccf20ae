// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite backend for the local structured store.
//!
//! All partitions share one database file:
//!
//! ```sql
//! CREATE TABLE entries (
//!   partition TEXT NOT NULL,
//!   key TEXT NOT NULL,          -- primary key (zero-padded for auto-increment ids)
//!   doc TEXT NOT NULL,          -- JSON document
//!   PRIMARY KEY (partition, key)
//! );
//! CREATE TABLE entry_index (
//!   partition TEXT NOT NULL,
//!   index_name TEXT NOT NULL,
//!   sort_value TEXT NOT NULL,   -- order-preserving encoding of the index value
//!   key TEXT NOT NULL,
//!   PRIMARY KEY (partition, index_name, key)
//! );
//! CREATE TABLE sequences (partition TEXT PRIMARY KEY, next_id INTEGER NOT NULL);
//! ```
//!
//! A document and its index rows are written in one transaction, so a crash
//! never leaves an entry half indexed.
//!
//! ## sqlx Any Driver Quirks
//!
//! Text columns may come back as bytes through the `Any` driver, so reads try
//! `String` first and fall back to `Vec<u8>`.

use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{debug, info};

use super::traits::{
    extract_index_entries, extract_key, Direction, PageRequest, Partition, ScanPosition, ScanRow,
    StoreBackend, StoreError,
};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

pub struct SqliteBackend {
    pool: AnyPool,
    path: String,
}

impl SqliteBackend {
    /// Open (or create) the store at `path`.
    ///
    /// Retries with the startup policy so a locked file on a cold start does
    /// not fail the session, then reports `Unavailable`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path_str);
        info!(path = %path_str, "Opening local store");
        Self::connect(&url, path_str, 4).await
    }

    /// Open a private in-memory database. Contents vanish with the backend.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        // One connection: every pooled connection to :memory: is its own database.
        Self::connect("sqlite::memory:", ":memory:".to_string(), 1).await
    }

    async fn connect(url: &str, path: String, max_connections: u32) -> Result<Self, StoreError> {
        install_drivers();

        let pool = retry("store_open", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .connect(url)
                .await
                .map_err(unavailable)
        })
        .await?;

        let backend = Self { pool, path };
        backend.enable_wal_mode().await?;
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Path of the database file (for display)
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn enable_wal_mode(&self) -> Result<(), StoreError> {
        if self.path == ":memory:" {
            return Ok(());
        }
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to enable WAL mode: {}", e)))?;
        // NORMAL is durable across application crashes in WAL mode
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS entries (
                partition TEXT NOT NULL,
                key TEXT NOT NULL,
                doc TEXT NOT NULL,
                PRIMARY KEY (partition, key)
            )",
            "CREATE TABLE IF NOT EXISTS entry_index (
                partition TEXT NOT NULL,
                index_name TEXT NOT NULL,
                sort_value TEXT NOT NULL,
                key TEXT NOT NULL,
                PRIMARY KEY (partition, index_name, key)
            )",
            "CREATE INDEX IF NOT EXISTS idx_entry_index_order
                ON entry_index (partition, index_name, sort_value, key)",
            "CREATE TABLE IF NOT EXISTS sequences (
                partition TEXT PRIMARY KEY,
                next_id INTEGER NOT NULL
            )",
        ];
        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Unavailable(format!("Failed to initialize schema: {}", e)))?;
        }
        Ok(())
    }

    fn decode_doc(partition: Partition, key: &str, row: &AnyRow) -> Result<Value, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            partition: partition.name(),
            key: key.to_string(),
            reason,
        };
        let text = text_column(row, "doc").ok_or_else(|| corrupt("no document".to_string()))?;
        serde_json::from_str(&text).map_err(|e| corrupt(e.to_string()))
    }
}

#[async_trait]
impl StoreBackend for SqliteBackend {
    async fn put(&self, partition: Partition, doc: Value) -> Result<String, StoreError> {
        let key = extract_key(partition, &doc)?;
        let postings = extract_index_entries(partition, &doc);
        let body = serde_json::to_string(&doc)
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        let name = partition.name();

        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        sqlx::query(
            "INSERT INTO entries (partition, key, doc) VALUES (?, ?, ?)
             ON CONFLICT(partition, key) DO UPDATE SET doc = excluded.doc",
        )
        .bind(name)
        .bind(&key)
        .bind(&body)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        sqlx::query("DELETE FROM entry_index WHERE partition = ? AND key = ?")
            .bind(name)
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

        for (index, sort) in &postings {
            sqlx::query(
                "INSERT INTO entry_index (partition, index_name, sort_value, key) VALUES (?, ?, ?, ?)",
            )
            .bind(name)
            .bind(*index)
            .bind(sort)
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        }
        tx.commit().await.map_err(unavailable)?;

        debug!(partition = name, key = %key, indexes = postings.len(), "Entry written");
        Ok(key)
    }

    async fn get(&self, partition: Partition, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT doc FROM entries WHERE partition = ? AND key = ?")
            .bind(partition.name())
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        row.map(|row| Self::decode_doc(partition, key, &row)).transpose()
    }

    async fn remove(&self, partition: Partition, key: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        for sql in [
            "DELETE FROM entry_index WHERE partition = ? AND key = ?",
            "DELETE FROM entries WHERE partition = ? AND key = ?",
        ] {
            sqlx::query(sql)
                .bind(partition.name())
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
        }
        tx.commit().await.map_err(unavailable)
    }

    async fn next_id(&self, partition: Partition) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        sqlx::query(
            "INSERT INTO sequences (partition, next_id) VALUES (?, 1)
             ON CONFLICT(partition) DO UPDATE SET next_id = next_id + 1",
        )
        .bind(partition.name())
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        let row = sqlx::query("SELECT next_id FROM sequences WHERE partition = ?")
            .bind(partition.name())
            .fetch_one(&mut *tx)
            .await
            .map_err(unavailable)?;
        tx.commit().await.map_err(unavailable)?;

        let id: i64 = row.try_get("next_id").map_err(unavailable)?;
        Ok(id as u64)
    }

    async fn count(
        &self,
        partition: Partition,
        only: Option<(&'static str, String)>,
    ) -> Result<u64, StoreError> {
        let row = match only {
            None => sqlx::query("SELECT COUNT(*) AS cnt FROM entries WHERE partition = ?")
                .bind(partition.name())
                .fetch_one(&self.pool)
                .await,
            Some((index, sort)) => sqlx::query(
                "SELECT COUNT(*) AS cnt FROM entry_index
                 WHERE partition = ? AND index_name = ? AND sort_value = ?",
            )
            .bind(partition.name())
            .bind(index)
            .bind(sort)
            .fetch_one(&self.pool)
            .await,
        }
        .map_err(unavailable)?;

        let count: i64 = row.try_get("cnt").map_err(unavailable)?;
        Ok(count as u64)
    }

    async fn scan_page(
        &self,
        partition: Partition,
        request: &PageRequest,
    ) -> Result<Vec<ScanRow>, StoreError> {
        let (cmp, order) = match request.direction {
            Direction::Ascending => (">", "ASC"),
            Direction::Descending => ("<", "DESC"),
        };

        let mut sql = match request.index {
            Some(_) => String::from(
                "SELECT i.sort_value AS sort_value, e.key AS key, e.doc AS doc
                 FROM entry_index i
                 JOIN entries e ON e.partition = i.partition AND e.key = i.key
                 WHERE i.partition = ? AND i.index_name = ?",
            ),
            None => String::from(
                "SELECT e.key AS sort_value, e.key AS key, e.doc AS doc
                 FROM entries e WHERE e.partition = ?",
            ),
        };
        if request.index.is_some() {
            if request.only.is_some() {
                sql.push_str(" AND i.sort_value = ?");
            }
            if request.after.is_some() {
                sql.push_str(&format!(
                    " AND (i.sort_value {cmp} ? OR (i.sort_value = ? AND i.key {cmp} ?))"
                ));
            }
            sql.push_str(&format!(" ORDER BY i.sort_value {order}, i.key {order}"));
        } else {
            if request.after.is_some() {
                sql.push_str(&format!(" AND e.key {cmp} ?"));
            }
            sql.push_str(&format!(" ORDER BY e.key {order}"));
        }
        sql.push_str(" LIMIT ?");

        let mut query = sqlx::query(&sql).bind(partition.name());
        if let Some(index) = request.index {
            query = query.bind(index);
            if let Some(ref only) = request.only {
                query = query.bind(only.clone());
            }
            if let Some(ref after) = request.after {
                query = query
                    .bind(after.sort.clone())
                    .bind(after.sort.clone())
                    .bind(after.key.clone());
            }
        } else if let Some(ref after) = request.after {
            query = query.bind(after.key.clone());
        }
        let rows = query
            .bind(request.limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        rows.iter()
            .map(|row| -> Result<ScanRow, StoreError> {
                let key = text_column(row, "key").ok_or_else(|| StoreError::Corrupt {
                    partition: partition.name(),
                    key: String::new(),
                    reason: "row without key".to_string(),
                })?;
                let sort = text_column(row, "sort_value").unwrap_or_else(|| key.clone());
                let doc = Self::decode_doc(partition, &key, row)?;
                Ok(ScanRow {
                    position: ScanPosition { sort, key },
                    doc,
                })
            })
            .collect()
    }
}
