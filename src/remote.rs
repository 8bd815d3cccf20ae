//! The remote collaborator: the network API that is the system of record.
//!
//! The engine only needs idempotent-by-key save and fetch calls, so the HTTP
//! client itself lives with the host. [`RemoteGateway`] wraps whatever
//! [`RemoteApi`] the host provides with a circuit breaker and metrics.
//! [`InMemoryRemote`] is a complete in-process implementation for tests,
//! demos and hosts that run without a server.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::record::Record;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use crate::storage::{Direction, Partition};

/// Any non-success response or transport error. The engine treats every
/// variant the same way: fall back to the local cache or queue the write.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected by server ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("remote circuit open, call not attempted")]
    CircuitOpen,

    #[error("unsupported operation kind '{0}'")]
    Unsupported(String),
}

/// Options for collection reads, honored by the remote and by the local
/// fallback scan alike.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Maximum number of records to return
    pub limit: Option<usize>,
    /// Order by creation timestamp
    pub direction: Direction,
    /// Only records whose key starts with this prefix
    pub key_prefix: Option<String>,
}

impl FetchOptions {
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn newest_first(mut self) -> Self {
        self.direction = Direction::Descending;
        self
    }

    #[must_use]
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Whether a key passes the prefix filter.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        self.key_prefix.as_deref().map_or(true, |p| key.starts_with(p))
    }
}

/// The network API the engine delivers to and reads from.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Idempotent save of one record into a partition.
    async fn save(&self, partition: Partition, record: &Record) -> Result<(), RemoteError>;

    /// Fetch one test result; `Ok(None)` when the server does not have it.
    async fn fetch(&self, key: &str) -> Result<Option<Record>, RemoteError>;

    /// Fetch a collection of test results.
    async fn fetch_all(&self, options: &FetchOptions) -> Result<Vec<Record>, RemoteError>;
}

/// Circuit-protected, instrumented access to a [`RemoteApi`].
pub struct RemoteGateway {
    api: Arc<dyn RemoteApi>,
    circuit: CircuitBreaker,
}

impl RemoteGateway {
    pub fn new(api: Arc<dyn RemoteApi>, circuit: &CircuitConfig) -> Self {
        Self {
            api,
            circuit: CircuitBreaker::new("remote", circuit),
        }
    }

    #[must_use]
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub async fn save(&self, partition: Partition, record: &Record) -> Result<(), RemoteError> {
        // Sync bookkeeping stays on the device
        let mut outbound = record.clone();
        outbound.synced_at = None;

        let start = Instant::now();
        let result = self.circuit.call(|| self.api.save(partition, &outbound)).await;
        Self::finish("save", start, result)
    }

    pub async fn fetch(&self, key: &str) -> Result<Option<Record>, RemoteError> {
        let start = Instant::now();
        let result = self.circuit.call(|| self.api.fetch(key)).await;
        Self::finish("fetch", start, result)
    }

    pub async fn fetch_all(&self, options: &FetchOptions) -> Result<Vec<Record>, RemoteError> {
        let start = Instant::now();
        let result = self.circuit.call(|| self.api.fetch_all(options)).await;
        Self::finish("fetch_all", start, result)
    }

    fn finish<T>(
        operation: &str,
        start: Instant,
        result: Result<T, CircuitError<RemoteError>>,
    ) -> Result<T, RemoteError> {
        crate::metrics::record_latency("remote", operation, start.elapsed());
        match result {
            Ok(value) => {
                crate::metrics::record_operation("remote", operation, "success");
                Ok(value)
            }
            Err(CircuitError::Rejected) => {
                crate::metrics::record_operation("remote", operation, "rejected");
                Err(RemoteError::CircuitOpen)
            }
            Err(CircuitError::Inner(e)) => {
                debug!(operation, error = %e, "Remote call failed");
                crate::metrics::record_operation("remote", operation, "error");
                Err(e)
            }
        }
    }
}

/// In-process remote that keeps everything it receives.
///
/// Availability can be toggled and individual keys rejected, which makes it
/// the collaborator of choice for exercising the offline paths.
pub struct InMemoryRemote {
    records: DashMap<(Partition, String), Record>,
    saves: Mutex<Vec<(Partition, Record)>>,
    rejected_keys: DashSet<String>,
    available: AtomicBool,
    calls: AtomicUsize,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            saves: Mutex::new(Vec::new()),
            rejected_keys: DashSet::new(),
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    /// When unavailable, every call fails with a transport error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Reject saves of `key` with a 422.
    pub fn reject_key(&self, key: impl Into<String>) {
        self.rejected_keys.insert(key.into());
    }

    pub fn accept_key(&self, key: &str) {
        self.rejected_keys.remove(key);
    }

    /// Seed a record as if another session had saved it.
    pub fn insert(&self, partition: Partition, record: Record) {
        self.records.insert((partition, record.key.clone()), record);
    }

    #[must_use]
    pub fn get(&self, partition: Partition, key: &str) -> Option<Record> {
        self.records
            .get(&(partition, key.to_string()))
            .map(|r| r.value().clone())
    }

    /// Every accepted save, in arrival order.
    #[must_use]
    pub fn saves(&self) -> Vec<(Partition, Record)> {
        self.saves.lock().clone()
    }

    /// Number of calls received, including failed ones.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn begin_call(&self) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Transport("connection refused".into()))
        }
    }
}

#[async_trait]
impl RemoteApi for InMemoryRemote {
    async fn save(&self, partition: Partition, record: &Record) -> Result<(), RemoteError> {
        self.begin_call()?;
        if self.rejected_keys.contains(&record.key) {
            return Err(RemoteError::Rejected {
                status: 422,
                message: format!("record '{}' rejected", record.key),
            });
        }
        self.records
            .insert((partition, record.key.clone()), record.clone());
        self.saves.lock().push((partition, record.clone()));
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<Record>, RemoteError> {
        self.begin_call()?;
        Ok(self.get(Partition::TestData, key))
    }

    async fn fetch_all(&self, options: &FetchOptions) -> Result<Vec<Record>, RemoteError> {
        self.begin_call()?;
        let mut records: Vec<Record> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == Partition::TestData && options.matches(&entry.key().1))
            .map(|entry| entry.value().clone())
            .collect();

        records.sort_by(|a, b| (a.timestamp, &a.key).cmp(&(b.timestamp, &b.key)));
        if options.direction == Direction::Descending {
            records.reverse();
        }
        if let Some(limit) = options.limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}
