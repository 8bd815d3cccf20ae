//! Sync queue.
//!
//! An append-only log of mutations that still have to reach the remote,
//! stored in the `syncQueue` partition. Operations move forward through
//! `pending → syncing → completed | failed`; the queue records whatever
//! status it is given and leaves transition legality to the orchestrator.
//!
//! # Example
//!
//! ```
//! use assessment_sync::queue::{OperationKind, OperationStatus, SyncQueue};
//! use assessment_sync::storage::Store;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), assessment_sync::SyncError> {
//! let queue = SyncQueue::new(Store::in_memory());
//! let id = queue.enqueue(OperationKind::SaveTestData, json!({"key": "ABC123"})).await?;
//!
//! assert_eq!(id, 1);
//! assert_eq!(queue.pending_count().await?, 1);
//!
//! queue.update_status(id, OperationStatus::Syncing, None).await?;
//! assert!(queue.list_pending().await?.is_empty());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::SyncError;
use crate::record::now_millis;
use crate::resilience::retry::RetryConfig;
use crate::storage::{numeric_key, Partition, ScanOptions, Store};

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
}

impl OperationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed operations are not revisited by a drain.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Forward-only transitions of a single drain.
    #[must_use]
    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Syncing)
                | (Self::Syncing, Self::Completed)
                | (Self::Syncing, Self::Failed)
        )
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a queued operation replays against the remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationKind {
    /// `remote.save` into `testData`
    SaveTestData,
    /// `remote.save` into `userData`
    SaveUserData,
    /// Written by a newer client; fails at dispatch
    Other(String),
}

impl OperationKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::SaveTestData => "saveTestData",
            Self::SaveUserData => "saveUserData",
            Self::Other(kind) => kind,
        }
    }

    /// Remote partition the operation is delivered to.
    #[must_use]
    pub fn partition(&self) -> Option<Partition> {
        match self {
            Self::SaveTestData => Some(Partition::TestData),
            Self::SaveUserData => Some(Partition::UserData),
            Self::Other(_) => None,
        }
    }
}

impl From<String> for OperationKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "saveTestData" => Self::SaveTestData,
            "saveUserData" => Self::SaveUserData,
            _ => Self::Other(kind),
        }
    }
}

impl From<OperationKind> for String {
    fn from(kind: OperationKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A durably queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Auto-assigned, increasing from 1
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// Payload to replay
    pub data: Value,
    pub status: OperationStatus,
    /// Enqueue time (epoch millis)
    pub timestamp: i64,
    pub last_updated: i64,
    /// Diagnostics: `error`, `failedAt`, `syncedAt`, `attempts`, `nextAttemptAt`
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SyncOperation {
    /// Delivery attempts that have failed so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.metadata
            .get("attempts")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize
    }

    /// Earliest time a failed operation may be requeued.
    #[must_use]
    pub fn next_attempt_at(&self) -> Option<i64> {
        self.metadata.get("nextAttemptAt").and_then(Value::as_i64)
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.metadata.get("error").and_then(Value::as_str)
    }

    /// Key of the record this operation delivers, if the payload has one.
    #[must_use]
    pub fn record_key(&self) -> Option<&str> {
        self.data.get("key").and_then(Value::as_str)
    }
}

/// Queue of [`SyncOperation`]s on top of the local store.
#[derive(Clone)]
pub struct SyncQueue {
    store: Store,
}

impl SyncQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Append a pending operation and return its id.
    #[tracing::instrument(skip(self, kind, data), fields(kind = %kind))]
    pub async fn enqueue(&self, kind: OperationKind, data: Value) -> Result<u64, SyncError> {
        let id = self.store.next_id(Partition::SyncQueue).await?;
        let now = now_millis();
        let op = SyncOperation {
            id,
            kind,
            data,
            status: OperationStatus::Pending,
            timestamp: now,
            last_updated: now,
            metadata: Map::new(),
        };
        self.store.put_json(Partition::SyncQueue, &op).await?;

        debug!(id, "Enqueued sync operation");
        crate::metrics::record_enqueue(op.kind.as_str());
        Ok(id)
    }

    pub async fn get(&self, id: u64) -> Result<Option<SyncOperation>, SyncError> {
        Ok(self
            .store
            .get_json(Partition::SyncQueue, &numeric_key(id))
            .await?)
    }

    /// Pending operations in enqueue order.
    pub async fn list_pending(&self) -> Result<Vec<SyncOperation>, SyncError> {
        self.list(Some(OperationStatus::Pending)).await
    }

    /// Operations in enqueue order, optionally only those in `status`.
    pub async fn list(&self, status: Option<OperationStatus>) -> Result<Vec<SyncOperation>, SyncError> {
        let options = match status {
            // Ties on the status value fall back to the id, i.e. enqueue order
            Some(status) => ScanOptions::by_index("status").only(status.as_str()),
            None => ScanOptions::default(),
        };
        Ok(self.store.scan(Partition::SyncQueue, options).collect().await?)
    }

    pub async fn pending_count(&self) -> Result<usize, SyncError> {
        let count = self
            .store
            .count(
                Partition::SyncQueue,
                Some(("status", OperationStatus::Pending.as_str().into())),
            )
            .await?;
        Ok(count as usize)
    }

    /// Set the status of an operation and merge `patch` into its metadata
    /// (top-level keys overwrite).
    pub async fn update_status(
        &self,
        id: u64,
        status: OperationStatus,
        patch: Option<Map<String, Value>>,
    ) -> Result<SyncOperation, SyncError> {
        let mut op = self.get(id).await?.ok_or(SyncError::OperationNotFound(id))?;

        op.status = status;
        if let Some(patch) = patch {
            op.metadata.extend(patch);
        }
        op.last_updated = now_millis();

        self.store.put_json(Partition::SyncQueue, &op).await?;
        Ok(op)
    }

    /// Whether an earlier write of `key` may still reach the remote: an
    /// operation that is pending, syncing, or failed with attempts left.
    pub async fn has_undelivered(
        &self,
        kind: &OperationKind,
        key: &str,
        policy: &RetryConfig,
    ) -> Result<bool, SyncError> {
        for status in [OperationStatus::Pending, OperationStatus::Syncing, OperationStatus::Failed] {
            let kind = kind.clone();
            let key = key.to_string();
            let options = ScanOptions::by_index("status")
                .only(status.as_str())
                .filter(move |op: &SyncOperation| op.kind == kind && op.record_key() == Some(key.as_str()));
            let mut cursor = self.store.scan::<SyncOperation>(Partition::SyncQueue, options);
            while let Some(op) = cursor.next().await? {
                if status != OperationStatus::Failed || policy.allows_attempt(op.attempts()) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Return failed operations to `pending` once their backoff has elapsed.
    ///
    /// Operations that used up `policy.max_retries` attempts stay failed, as
    /// do operations superseded by a later delivered write of the same key:
    /// replaying those would overwrite newer data on the remote.
    #[tracing::instrument(skip(self, policy))]
    pub async fn requeue_failed(&self, policy: &RetryConfig, now: i64) -> Result<usize, SyncError> {
        let mut delivered: HashMap<(OperationKind, String), u64> = HashMap::new();
        for op in self.list(Some(OperationStatus::Completed)).await? {
            if let Some(key) = op.record_key() {
                let latest = delivered.entry((op.kind.clone(), key.to_string())).or_insert(op.id);
                *latest = (*latest).max(op.id);
            }
        }

        let mut requeued = 0;
        for op in self.list(Some(OperationStatus::Failed)).await? {
            let due = op.next_attempt_at().map_or(true, |at| at <= now);
            if !due || !policy.allows_attempt(op.attempts()) {
                continue;
            }
            let superseded = op
                .record_key()
                .and_then(|key| delivered.get(&(op.kind.clone(), key.to_string())))
                .is_some_and(|latest| *latest > op.id);
            if superseded {
                continue;
            }

            let mut patch = Map::new();
            patch.insert("requeuedAt".into(), Value::from(now));
            self.update_status(op.id, OperationStatus::Pending, Some(patch)).await?;
            requeued += 1;
        }

        if requeued > 0 {
            info!(requeued, "Requeued failed sync operations");
            crate::metrics::record_requeue(requeued);
        }
        Ok(requeued)
    }

    /// Operations enqueued at or after `since`, newest first.
    pub async fn list_enqueued_since(&self, since: i64) -> Result<Vec<SyncOperation>, SyncError> {
        let mut cursor = self
            .store
            .scan::<SyncOperation>(Partition::SyncQueue, ScanOptions::by_index("timestamp").descending());
        let mut ops = Vec::new();
        while let Some(op) = cursor.next().await? {
            if op.timestamp < since {
                break;
            }
            ops.push(op);
        }
        Ok(ops)
    }

    /// Delete terminal operations last updated before `older_than`.
    pub async fn prune(&self, status: OperationStatus, older_than: i64) -> Result<usize, SyncError> {
        if !status.is_terminal() {
            return Ok(0);
        }
        self.prune_where(status, move |op| op.last_updated < older_than).await
    }

    /// Delete failed operations that used up their attempts and were last
    /// updated before `older_than`. Failed operations with attempts left are
    /// kept for [`Self::requeue_failed`].
    pub async fn prune_exhausted(&self, policy: &RetryConfig, older_than: i64) -> Result<usize, SyncError> {
        let policy = policy.clone();
        self.prune_where(OperationStatus::Failed, move |op| {
            op.last_updated < older_than && !policy.allows_attempt(op.attempts())
        })
        .await
    }

    async fn prune_where(
        &self,
        status: OperationStatus,
        predicate: impl Fn(&SyncOperation) -> bool + Send + Sync + 'static,
    ) -> Result<usize, SyncError> {
        let options = ScanOptions::by_index("status").only(status.as_str()).filter(predicate);
        let stale: Vec<SyncOperation> = self.store.scan(Partition::SyncQueue, options).collect().await?;

        for op in &stale {
            self.store.remove(Partition::SyncQueue, &numeric_key(op.id)).await?;
        }
        if !stale.is_empty() {
            info!(pruned = stale.len(), status = %status, "Pruned sync operations");
            crate::metrics::record_prune(stale.len());
        }
        Ok(stale.len())
    }

    /// Return operations stuck in `syncing` by an interrupted drain to
    /// `pending`. Only safe while no drain is running.
    pub async fn recover_stale(&self) -> Result<usize, SyncError> {
        let stale = self.list(Some(OperationStatus::Syncing)).await?;
        let now = now_millis();
        for op in &stale {
            let mut patch = Map::new();
            patch.insert("recoveredAt".into(), Value::from(now));
            self.update_status(op.id, OperationStatus::Pending, Some(patch)).await?;
        }
        if !stale.is_empty() {
            info!(recovered = stale.len(), "Recovered interrupted sync operations");
        }
        Ok(stale.len())
    }
}
