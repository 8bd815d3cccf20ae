use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::traits::{
    extract_index_entries, extract_key, Direction, PageRequest, Partition, ScanPosition, ScanRow,
    StoreBackend, StoreError,
};

#[derive(Default)]
struct PartitionData {
    entries: BTreeMap<String, Value>,
    /// index name -> ordered (sort key, primary key)
    indexes: HashMap<&'static str, BTreeSet<(String, String)>>,
    /// primary key -> index entries currently held, for overwrite and removal
    postings: HashMap<String, Vec<(&'static str, String)>>,
    next_id: u64,
}

impl PartitionData {
    fn unindex(&mut self, key: &str) {
        if let Some(postings) = self.postings.remove(key) {
            for (index, sort) in postings {
                if let Some(set) = self.indexes.get_mut(index) {
                    set.remove(&(sort, key.to_string()));
                }
            }
        }
    }
}

/// Ephemeral backend for tests and sessions where the device refuses
/// persistent storage.
///
/// Each partition lives behind one DashMap shard lock, so a `put` or
/// `remove` (document plus index entries) is applied atomically.
pub struct MemoryBackend {
    partitions: DashMap<Partition, PartitionData>,
    len: AtomicUsize,
    max_entries: Option<usize>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
            len: AtomicUsize::new(0),
            max_entries: None,
        }
    }

    /// Backend that reports `Unavailable` once `max_entries` documents are
    /// held, the way a quota-exhausted device store behaves.
    #[must_use]
    pub fn with_quota(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            ..Self::new()
        }
    }

    /// Total documents across all partitions
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn window<'a, I>(iter: I, request: &PageRequest) -> Vec<ScanPosition>
where
    I: DoubleEndedIterator<Item = &'a (String, String)>,
{
    let only = request.only.as_deref();
    let matches = move |(sort, _): &&(String, String)| only.map_or(true, |o| sort == o);
    let to_pos = |(sort, key): &(String, String)| ScanPosition {
        sort: sort.clone(),
        key: key.clone(),
    };
    match request.direction {
        Direction::Ascending => iter.filter(matches).take(request.limit).map(to_pos).collect(),
        Direction::Descending => iter.rev().filter(matches).take(request.limit).map(to_pos).collect(),
    }
}

fn bounds(request: &PageRequest) -> (Bound<(String, String)>, Bound<(String, String)>) {
    match (&request.after, request.direction) {
        (None, _) => (Bound::Unbounded, Bound::Unbounded),
        (Some(after), Direction::Ascending) => (
            Bound::Excluded((after.sort.clone(), after.key.clone())),
            Bound::Unbounded,
        ),
        (Some(after), Direction::Descending) => (
            Bound::Unbounded,
            Bound::Excluded((after.sort.clone(), after.key.clone())),
        ),
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn put(&self, partition: Partition, doc: Value) -> Result<String, StoreError> {
        let key = extract_key(partition, &doc)?;
        let postings = extract_index_entries(partition, &doc);

        let mut data = self.partitions.entry(partition).or_default();
        let is_new = !data.entries.contains_key(&key);
        if is_new {
            if let Some(max) = self.max_entries {
                if self.len() >= max {
                    return Err(StoreError::Unavailable(format!(
                        "quota exceeded: {} entries (max {})",
                        self.len(),
                        max
                    )));
                }
            }
        }

        data.unindex(&key);
        for (index, sort) in &postings {
            data.indexes
                .entry(*index)
                .or_default()
                .insert((sort.clone(), key.clone()));
        }
        data.postings.insert(key.clone(), postings);
        data.entries.insert(key.clone(), doc);
        if is_new {
            self.len.fetch_add(1, Ordering::AcqRel);
        }
        Ok(key)
    }

    async fn get(&self, partition: Partition, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .partitions
            .get(&partition)
            .and_then(|data| data.entries.get(key).cloned()))
    }

    async fn remove(&self, partition: Partition, key: &str) -> Result<(), StoreError> {
        if let Some(mut data) = self.partitions.get_mut(&partition) {
            data.unindex(key);
            if data.entries.remove(key).is_some() {
                self.len.fetch_sub(1, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    async fn next_id(&self, partition: Partition) -> Result<u64, StoreError> {
        let mut data = self.partitions.entry(partition).or_default();
        data.next_id += 1;
        Ok(data.next_id)
    }

    async fn count(
        &self,
        partition: Partition,
        only: Option<(&'static str, String)>,
    ) -> Result<u64, StoreError> {
        let Some(data) = self.partitions.get(&partition) else {
            return Ok(0);
        };
        let count = match only {
            None => data.entries.len(),
            Some((index, sort)) => data
                .indexes
                .get(index)
                .map_or(0, |set| set.iter().filter(|(s, _)| *s == sort).count()),
        };
        Ok(count as u64)
    }

    async fn scan_page(
        &self,
        partition: Partition,
        request: &PageRequest,
    ) -> Result<Vec<ScanRow>, StoreError> {
        let Some(data) = self.partitions.get(&partition) else {
            return Ok(Vec::new());
        };

        let positions = match request.index {
            Some(index) => match data.indexes.get(index) {
                Some(set) => window(set.range(bounds(request)), request),
                None => Vec::new(),
            },
            None => {
                // Primary-key order: the sort key is the primary key itself.
                let keys: BTreeSet<(String, String)> = data
                    .entries
                    .keys()
                    .map(|k| (k.clone(), k.clone()))
                    .collect();
                window(keys.range(bounds(request)), request)
            }
        };

        Ok(positions
            .into_iter()
            .filter_map(|position| {
                data.entries.get(&position.key).map(|doc| ScanRow {
                    doc: doc.clone(),
                    position,
                })
            })
            .collect())
    }
}
