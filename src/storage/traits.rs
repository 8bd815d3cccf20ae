use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The underlying storage cannot be opened or written (disabled, quota
    /// exhausted, I/O failure). Fatal for the session.
    #[error("Local store unavailable: {0}")]
    Unavailable(String),
    /// The document has no usable primary key.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
    /// A stored document could not be decoded.
    #[error("Corrupt entry '{key}' in {partition}: {reason}")]
    Corrupt {
        partition: &'static str,
        key: String,
        reason: String,
    },
}

/// Named, independently addressable collections of the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Partition {
    /// Assessment results, keyed by test code
    TestData,
    /// Pending mutations, keyed by auto-increment id
    SyncQueue,
    /// User profile data, keyed by user id
    UserData,
    /// Local settings, keyed by setting name
    Settings,
}

/// Static layout of a partition: where its primary key lives in the document
/// and which document fields are indexed.
#[derive(Debug, Clone, Copy)]
pub struct PartitionSpec {
    pub name: &'static str,
    pub key_path: &'static str,
    pub auto_increment: bool,
    pub indexes: &'static [&'static str],
}

impl Partition {
    pub const ALL: [Partition; 4] = [
        Partition::TestData,
        Partition::SyncQueue,
        Partition::UserData,
        Partition::Settings,
    ];

    #[must_use]
    pub fn spec(self) -> PartitionSpec {
        match self {
            Self::TestData => PartitionSpec {
                name: "testData",
                key_path: "key",
                auto_increment: false,
                indexes: &["timestamp", "lastModified"],
            },
            Self::SyncQueue => PartitionSpec {
                name: "syncQueue",
                key_path: "id",
                auto_increment: true,
                indexes: &["timestamp", "status"],
            },
            Self::UserData => PartitionSpec {
                name: "userData",
                key_path: "key",
                auto_increment: false,
                indexes: &["lastModified"],
            },
            Self::Settings => PartitionSpec {
                name: "settings",
                key_path: "key",
                auto_increment: false,
                indexes: &[],
            },
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.spec().name
    }

    #[must_use]
    pub fn has_index(self, index: &str) -> bool {
        self.spec().indexes.contains(&index)
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A typed secondary index value.
///
/// Integers sort before text, matching how an indexed document store orders
/// mixed keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexValue {
    Int(i64),
    Text(String),
}

impl IndexValue {
    /// Extract an index value from a document field. Fields that are absent
    /// or not a scalar leave the document out of that index.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Bool(b) => Some(Self::Int(i64::from(*b))),
            _ => None,
        }
    }

    /// Order-preserving string encoding shared by every backend.
    #[must_use]
    pub fn sort_key(&self) -> String {
        match self {
            // Flip the sign bit so negative numbers sort first as unsigned hex.
            Self::Int(n) => format!("0{:016x}", (*n as u64) ^ (1 << 63)),
            Self::Text(s) => format!("1{}", s),
        }
    }
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for IndexValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Encode a numeric auto-increment id as a primary key that sorts
/// lexically in numeric order.
#[must_use]
pub fn numeric_key(id: u64) -> String {
    format!("{:020}", id)
}

/// Extract the primary key from a document according to the partition spec.
pub fn extract_key(partition: Partition, doc: &Value) -> Result<String, StoreError> {
    let spec = partition.spec();
    match doc.get(spec.key_path) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) if spec.auto_increment => n
            .as_u64()
            .filter(|id| *id > 0)
            .map(numeric_key)
            .ok_or_else(|| {
                StoreError::InvalidRecord(format!("{}: '{}' must be a positive id", spec.name, spec.key_path))
            }),
        _ => Err(StoreError::InvalidRecord(format!(
            "{}: missing primary key '{}'",
            spec.name, spec.key_path
        ))),
    }
}

/// Extract every index entry `(index name, sort key)` for a document.
#[must_use]
pub fn extract_index_entries(partition: Partition, doc: &Value) -> Vec<(&'static str, String)> {
    partition
        .spec()
        .indexes
        .iter()
        .filter_map(|index| {
            doc.get(*index)
                .and_then(IndexValue::from_json)
                .map(|v| (*index, v.sort_key()))
        })
        .collect()
}

/// Scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// Position of a row within a scan: its index sort key (or primary key for
/// primary-key scans) plus its primary key as tie breaker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScanPosition {
    pub sort: String,
    pub key: String,
}

/// One page request issued by a [`super::Cursor`].
#[derive(Debug, Clone)]
pub struct PageRequest {
    /// Index to order by; `None` orders by primary key
    pub index: Option<&'static str>,
    pub direction: Direction,
    /// Restrict to entries whose index value equals this sort key
    pub only: Option<String>,
    /// Resume strictly after this position (in scan direction)
    pub after: Option<ScanPosition>,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct ScanRow {
    pub position: ScanPosition,
    pub doc: Value,
}

/// A storage backend for the local structured store.
///
/// Every mutating call is atomic: the document and its index entries are
/// either fully written or not at all. There are no cross-partition
/// transactions.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Insert or overwrite by primary key; returns the key.
    async fn put(&self, partition: Partition, doc: Value) -> Result<String, StoreError>;

    /// Fetch by primary key. A missing key is `Ok(None)`.
    async fn get(&self, partition: Partition, key: &str) -> Result<Option<Value>, StoreError>;

    /// Delete by primary key. Idempotent.
    async fn remove(&self, partition: Partition, key: &str) -> Result<(), StoreError>;

    /// Allocate the next auto-increment id. Ids are never reused, even after
    /// the entry holding one is removed.
    async fn next_id(&self, partition: Partition) -> Result<u64, StoreError>;

    /// Count entries, optionally only those whose `index` equals a sort key.
    async fn count(
        &self,
        partition: Partition,
        only: Option<(&'static str, String)>,
    ) -> Result<u64, StoreError>;

    /// Fetch one page of an ordered scan.
    async fn scan_page(
        &self,
        partition: Partition,
        request: &PageRequest,
    ) -> Result<Vec<ScanRow>, StoreError>;
}
