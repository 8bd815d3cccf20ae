//! Local structured store.
//!
//! Durable, partitioned key/value storage with secondary indexes and cursor
//! iteration. [`Store`] is the handle the rest of the crate uses; the
//! [`StoreBackend`] trait is implemented by [`SqliteBackend`] (durable, on
//! device) and [`MemoryBackend`] (ephemeral).
//!
//! # Example
//!
//! ```
//! use assessment_sync::storage::{Partition, ScanOptions, Store};
//! use assessment_sync::Record;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), assessment_sync::storage::StoreError> {
//! let store = Store::in_memory();
//! store.put_record(Partition::TestData, &Record::new("ABC123", json!({"mbti": "INFP"}))).await?;
//!
//! let all: Vec<Record> = store
//!     .scan(Partition::TestData, ScanOptions::by_index("timestamp"))
//!     .collect()
//!     .await?;
//! assert_eq!(all.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod sqlite;
pub mod traits;

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::record::{now_millis, Record};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
pub use traits::{
    numeric_key, Direction, IndexValue, PageRequest, Partition, ScanPosition, ScanRow,
    StoreBackend, StoreError,
};

/// Default number of entries a cursor fetches per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

type Filter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// How to iterate a partition.
pub struct ScanOptions<T> {
    /// Index to order by; `None` orders by primary key
    pub index: Option<&'static str>,
    pub direction: Direction,
    /// Only entries whose index value equals this
    pub only: Option<IndexValue>,
    /// Predicate evaluated per entry before it is yielded
    pub filter: Option<Filter<T>>,
}

impl<T> Default for ScanOptions<T> {
    fn default() -> Self {
        Self {
            index: None,
            direction: Direction::Ascending,
            only: None,
            filter: None,
        }
    }
}

impl<T> Clone for ScanOptions<T> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            direction: self.direction,
            only: self.only.clone(),
            filter: self.filter.clone(),
        }
    }
}

impl<T> ScanOptions<T> {
    #[must_use]
    pub fn by_index(index: &'static str) -> Self {
        Self {
            index: Some(index),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn descending(mut self) -> Self {
        self.direction = Direction::Descending;
        self
    }

    #[must_use]
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    #[must_use]
    pub fn only(mut self, value: impl Into<IndexValue>) -> Self {
        self.only = Some(value.into());
        self
    }

    #[must_use]
    pub fn filter(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(predicate));
        self
    }
}

/// Lazy, finite, restartable iteration over a partition.
///
/// Entries are fetched from the backend one page at a time and decoded as
/// they are yielded. [`Cursor::restart`] rewinds to the beginning; entries
/// written since are then visible.
pub struct Cursor<T> {
    backend: Arc<dyn StoreBackend>,
    partition: Partition,
    options: ScanOptions<T>,
    page_size: usize,
    buffer: VecDeque<ScanRow>,
    position: Option<ScanPosition>,
    exhausted: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Cursor<T> {
    /// Next matching entry, or `None` once the partition is exhausted.
    pub async fn next(&mut self) -> Result<Option<T>, StoreError> {
        loop {
            let Some(row) = self.buffer.pop_front() else {
                if self.exhausted {
                    return Ok(None);
                }
                self.fill().await?;
                continue;
            };

            self.position = Some(row.position.clone());
            let item: T = serde_json::from_value(row.doc).map_err(|e| StoreError::Corrupt {
                partition: self.partition.name(),
                key: row.position.key.clone(),
                reason: e.to_string(),
            })?;
            if self.options.filter.as_ref().map_or(true, |f| f(&item)) {
                return Ok(Some(item));
            }
        }
    }

    /// Rewind to the first entry.
    pub fn restart(&mut self) {
        self.buffer.clear();
        self.position = None;
        self.exhausted = false;
    }

    /// Drain the remaining entries into a vector.
    pub async fn collect(mut self) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await? {
            out.push(item);
        }
        Ok(out)
    }

    async fn fill(&mut self) -> Result<(), StoreError> {
        let request = PageRequest {
            index: self.options.index,
            direction: self.options.direction,
            only: self.options.only.as_ref().map(IndexValue::sort_key),
            after: self.position.clone(),
            limit: self.page_size,
        };
        let rows = self.backend.scan_page(self.partition, &request).await?;
        if rows.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(rows);
        Ok(())
    }
}

/// Handle to the local structured store.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StoreBackend>,
    page_size: usize,
}

impl Store {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Ephemeral store backed by [`MemoryBackend`].
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Durable store backed by a SQLite file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(SqliteBackend::open(path).await?)))
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Insert or overwrite by primary key; returns the key.
    pub async fn put(&self, partition: Partition, doc: Value) -> Result<String, StoreError> {
        self.backend.put(partition, doc).await
    }

    /// Serialize and store any document type.
    pub async fn put_json<T: Serialize>(&self, partition: Partition, value: &T) -> Result<String, StoreError> {
        let doc = serde_json::to_value(value).map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        self.put(partition, doc).await
    }

    pub async fn get(&self, partition: Partition, key: &str) -> Result<Option<Value>, StoreError> {
        self.backend.get(partition, key).await
    }

    /// Fetch and decode a document.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        partition: Partition,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        self.get(partition, key)
            .await?
            .map(|doc| {
                serde_json::from_value(doc).map_err(|e| StoreError::Corrupt {
                    partition: partition.name(),
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    pub async fn remove(&self, partition: Partition, key: &str) -> Result<(), StoreError> {
        self.backend.remove(partition, key).await
    }

    pub async fn next_id(&self, partition: Partition) -> Result<u64, StoreError> {
        self.backend.next_id(partition).await
    }

    /// Count entries, optionally only those whose `index` equals `value`.
    pub async fn count(
        &self,
        partition: Partition,
        only: Option<(&'static str, IndexValue)>,
    ) -> Result<u64, StoreError> {
        self.backend
            .count(partition, only.map(|(index, value)| (index, value.sort_key())))
            .await
    }

    /// Open a cursor over `partition`.
    pub fn scan<T: DeserializeOwned>(&self, partition: Partition, options: ScanOptions<T>) -> Cursor<T> {
        Cursor {
            backend: self.backend.clone(),
            partition,
            options,
            page_size: self.page_size,
            buffer: VecDeque::new(),
            position: None,
            exhausted: false,
            _marker: PhantomData,
        }
    }

    pub async fn get_record(&self, partition: Partition, key: &str) -> Result<Option<Record>, StoreError> {
        self.get_json(partition, key).await
    }

    /// Store a record as an overwrite of any existing one with the same key:
    /// the creation timestamp of the existing record is kept, the sync
    /// stamps are stored as given. For remote copies and sync bookkeeping;
    /// local edits go through [`Self::write_record`].
    pub async fn put_record(&self, partition: Partition, record: &Record) -> Result<Record, StoreError> {
        let existing = self.existing_record(partition, record).await?;
        self.store_record(partition, record.clone().overwriting(existing.as_ref()))
            .await
    }

    /// Store a local edit: `lastModified` is stamped past the previous write
    /// and `syncedAt` is cleared, whatever the caller's copy carried.
    pub async fn write_record(&self, partition: Partition, record: &Record) -> Result<Record, StoreError> {
        let existing = self.existing_record(partition, record).await?;
        self.store_record(partition, record.clone().edited(existing.as_ref(), now_millis()))
            .await
    }

    async fn existing_record(&self, partition: Partition, record: &Record) -> Result<Option<Record>, StoreError> {
        if record.key.trim().is_empty() {
            return Err(StoreError::InvalidRecord(format!("{}: record key is empty", partition)));
        }
        self.get_record(partition, &record.key).await
    }

    async fn store_record(&self, partition: Partition, record: Record) -> Result<Record, StoreError> {
        let doc = record
            .to_document()
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        self.put(partition, doc).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(key: &str, ts: i64) -> Record {
        let mut r = Record::new(key, json!({"score": ts}));
        r.timestamp = ts;
        r.last_modified = ts;
        r
    }

    async fn seeded(page_size: usize) -> Store {
        let store = Store::in_memory().with_page_size(page_size);
        for (key, ts) in [("c", 3), ("a", 5), ("e", 1), ("b", 4), ("d", 2)] {
            store.put_record(Partition::TestData, &record(key, ts)).await.unwrap();
        }
        store
    }

    fn keys(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.key.as_str()).collect()
    }

    #[tokio::test]
    async fn test_scan_default_is_primary_key_order() {
        let store = seeded(2).await;
        let all: Vec<Record> = store
            .scan(Partition::TestData, ScanOptions::default())
            .collect()
            .await
            .unwrap();
        assert_eq!(keys(&all), ["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_scan_by_index_descending_across_pages() {
        let store = seeded(2).await;
        let all: Vec<Record> = store
            .scan(Partition::TestData, ScanOptions::by_index("timestamp").descending())
            .collect()
            .await
            .unwrap();
        assert_eq!(keys(&all), ["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_scan_filter_applies_per_entry() {
        let store = seeded(2).await;
        let even: Vec<Record> = store
            .scan(
                Partition::TestData,
                ScanOptions::by_index("timestamp").filter(|r: &Record| r.timestamp % 2 == 0),
            )
            .collect()
            .await
            .unwrap();
        assert_eq!(keys(&even), ["d", "b"]);
    }

    #[tokio::test]
    async fn test_cursor_is_lazy_and_restartable() {
        let store = seeded(2).await;
        let mut cursor = store.scan::<Record>(Partition::TestData, ScanOptions::default());

        assert_eq!(cursor.next().await.unwrap().unwrap().key, "a");
        assert_eq!(cursor.next().await.unwrap().unwrap().key, "b");

        // Written after the cursor moved past it: visible after restart
        store.put_record(Partition::TestData, &record("0", 9)).await.unwrap();
        cursor.restart();
        assert_eq!(cursor.next().await.unwrap().unwrap().key, "0");

        let rest = cursor.collect().await.unwrap();
        assert_eq!(keys(&rest), ["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_cursor_ends() {
        let store = Store::in_memory();
        let mut cursor = store.scan::<Record>(Partition::TestData, ScanOptions::default());
        assert!(cursor.next().await.unwrap().is_none());
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_record_preserves_creation_time() {
        let store = Store::in_memory();
        store.put_record(Partition::TestData, &record("k", 100)).await.unwrap();

        let updated = Record::new("k", json!({"score": 7}));
        let stored = store.put_record(Partition::TestData, &updated).await.unwrap();

        assert_eq!(stored.timestamp, 100);
        let fetched = store.get_record(Partition::TestData, "k").await.unwrap().unwrap();
        assert_eq!(fetched.timestamp, 100);
        assert_eq!(fetched.payload, json!({"score": 7}));
        assert_eq!(store.count(Partition::TestData, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_write_record_restamps_local_edit() {
        let store = Store::in_memory();
        let mut synced = record("k", 100);
        synced.synced_at = Some(200);
        store.put_record(Partition::TestData, &synced).await.unwrap();

        let mut edit = store.get_record(Partition::TestData, "k").await.unwrap().unwrap();
        edit.payload = json!({"score": 8});
        let stored = store.write_record(Partition::TestData, &edit).await.unwrap();

        assert_eq!(stored.timestamp, 100);
        assert!(stored.last_modified > 100);
        assert!(stored.has_unsynced_changes());
        let fetched = store.get_record(Partition::TestData, "k").await.unwrap().unwrap();
        assert_eq!(fetched, stored);
    }

    #[tokio::test]
    async fn test_put_record_rejects_empty_key() {
        let store = Store::in_memory();
        let err = store
            .put_record(Partition::TestData, &Record::new("", json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
    }

    #[tokio::test]
    async fn test_get_json_reports_corrupt_documents() {
        let store = Store::in_memory();
        store.put(Partition::TestData, json!({"key": "x", "payload": 1})).await.unwrap();
        // timestamp fields missing: not a Record
        let err = store.get_record(Partition::TestData, "x").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
