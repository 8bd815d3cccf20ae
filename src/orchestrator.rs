//! Background sync orchestrator.
//!
//! A drain-once operation: when online, every pending operation is replayed
//! against the remote in enqueue order and marked `completed` or `failed`.
//! The orchestrator is trigger-agnostic; [`crate::SyncClient`] decides when
//! to call it.
//!
//! # Guarantees
//!
//! - Operations within a run are delivered strictly sequentially, so two
//!   writes to the same key reach the remote in the order they were made.
//! - Runs never overlap. A call made while a drain is in flight returns
//!   [`SyncOutcome::Skipped`] with [`SkipReason::InFlight`].
//! - A failed operation is not retried within the run. It carries its
//!   attempt count and next eligible time in metadata, and only
//!   [`SyncQueue::requeue_failed`] returns it to `pending`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::connectivity::Connectivity;
use crate::error::SyncError;
use crate::queue::{OperationStatus, SyncOperation, SyncQueue};
use crate::record::{now_millis, Record};
use crate::remote::{RemoteError, RemoteGateway};
use crate::resilience::retry::RetryConfig;
use crate::storage::Partition;

/// Aggregate result of one drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    pub total: usize,
    /// Epoch millis
    pub finished_at: i64,
}

impl SyncReport {
    /// True when every visited operation was delivered.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Why a sync call did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    InFlight,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::InFlight => write!(f, "in_flight"),
        }
    }
}

/// Result of [`SyncOrchestrator::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Skipped(SkipReason),
}

impl SyncOutcome {
    /// A skipped run is a no-op, not an error, but not a success either.
    #[must_use]
    pub fn success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    #[must_use]
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Skipped(_) => None,
        }
    }
}

/// Drains the sync queue against the remote.
pub struct SyncOrchestrator {
    queue: SyncQueue,
    remote: Arc<RemoteGateway>,
    connectivity: Arc<dyn Connectivity>,
    retry: RetryConfig,
    running: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        queue: SyncQueue,
        remote: Arc<RemoteGateway>,
        connectivity: Arc<dyn Connectivity>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            queue,
            remote,
            connectivity,
            retry,
            running: AtomicBool::new(false),
        }
    }

    /// Whether a drain is in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Drain all pending operations once.
    ///
    /// Store failures abort the run and propagate; remote failures only
    /// mark the affected operation `failed`.
    #[tracing::instrument(skip(self))]
    pub async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        if !self.connectivity.is_online() {
            debug!("Sync skipped: offline");
            crate::metrics::record_sync_skipped("offline");
            return Ok(SyncOutcome::Skipped(SkipReason::Offline));
        }
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("Sync skipped: drain already in flight");
            crate::metrics::record_sync_skipped("in_flight");
            return Ok(SyncOutcome::Skipped(SkipReason::InFlight));
        }
        let _guard = RunGuard(&self.running);

        let start = Instant::now();
        let pending = self.queue.list_pending().await?;
        let mut report = SyncReport {
            synced: 0,
            failed: 0,
            total: 0,
            finished_at: 0,
        };

        if !pending.is_empty() {
            info!(pending = pending.len(), "Starting sync drain");
        }

        for op in pending {
            match self.deliver(op).await? {
                Some(true) => report.synced += 1,
                Some(false) => report.failed += 1,
                None => continue,
            }
            report.total += 1;
        }

        report.finished_at = now_millis();
        crate::metrics::record_sync_run(&report, start.elapsed());
        if report.total > 0 {
            info!(
                synced = report.synced,
                failed = report.failed,
                total = report.total,
                "Sync drain complete"
            );
        }
        Ok(SyncOutcome::Completed(report))
    }

    /// Replay one operation. Returns whether it was delivered, or `None`
    /// when it was no longer pending by the time its turn came.
    async fn deliver(&self, listed: SyncOperation) -> Result<Option<bool>, SyncError> {
        // Another client over the same store may have moved it on since the listing
        let op = match self.queue.get(listed.id).await? {
            Some(op) if op.status.can_transition_to(OperationStatus::Syncing) => op,
            _ => {
                debug!(id = listed.id, "Sync operation no longer pending, skipped");
                return Ok(None);
            }
        };
        self.queue.update_status(op.id, OperationStatus::Syncing, None).await?;

        match self.dispatch(&op).await {
            Ok((partition, record)) => {
                let now = now_millis();
                let mut patch = Map::new();
                patch.insert("syncedAt".into(), Value::from(now));
                self.queue
                    .update_status(op.id, OperationStatus::Completed, Some(patch))
                    .await?;
                self.mark_synced(partition, &record, now).await?;

                debug!(id = op.id, kind = %op.kind, "Sync operation delivered");
                crate::metrics::record_operation_result(op.kind.as_str(), "completed");
                Ok(Some(true))
            }
            Err(error) => {
                let now = now_millis();
                let attempts = op.attempts() + 1;
                let mut patch = Map::new();
                patch.insert("error".into(), Value::from(error.clone()));
                patch.insert("failedAt".into(), Value::from(now));
                patch.insert("attempts".into(), Value::from(attempts as u64));
                if self.retry.allows_attempt(attempts) {
                    let delay = self.retry.delay_for_attempt(attempts);
                    patch.insert("nextAttemptAt".into(), Value::from(now + delay.as_millis() as i64));
                } else {
                    // Drop the schedule left by the previous failure
                    patch.insert("nextAttemptAt".into(), Value::Null);
                    warn!(id = op.id, attempts, "Sync operation exhausted its attempts");
                }
                self.queue
                    .update_status(op.id, OperationStatus::Failed, Some(patch))
                    .await?;

                warn!(id = op.id, kind = %op.kind, error = %error, "Sync operation failed");
                crate::metrics::record_operation_result(op.kind.as_str(), "failed");
                Ok(Some(false))
            }
        }
    }

    /// Send an operation to the remote. Errors are the message recorded on
    /// the failed operation.
    async fn dispatch(&self, op: &SyncOperation) -> Result<(Partition, Record), String> {
        let Some(partition) = op.kind.partition() else {
            return Err(RemoteError::Unsupported(op.kind.to_string()).to_string());
        };
        let record = Record::from_document(op.data.clone())
            .map_err(|e| format!("undecodable {} payload: {}", op.kind, e))?;

        self.remote
            .save(partition, &record)
            .await
            .map_err(|e| e.to_string())?;
        Ok((partition, record))
    }

    /// Stamp the local copy as confirmed, unless it was rewritten after the
    /// version that was just delivered.
    async fn mark_synced(&self, partition: Partition, delivered: &Record, now: i64) -> Result<(), SyncError> {
        let store = self.queue.store();
        let Some(mut local) = store.get_record(partition, &delivered.key).await? else {
            return Ok(());
        };
        if local.last_modified <= delivered.last_modified {
            local.synced_at = Some(now);
            store.put_record(partition, &local).await?;
        }
        Ok(())
    }
}

/// RAII guard to reset the running flag.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ManualConnectivity;
    use crate::queue::OperationKind;
    use crate::remote::{FetchOptions, InMemoryRemote, RemoteApi};
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::storage::Store;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn lenient() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 100,
            error_rate: 0.99,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    fn orchestrator(remote: Arc<dyn RemoteApi>, online: bool) -> (SyncOrchestrator, SyncQueue) {
        let queue = SyncQueue::new(Store::in_memory());
        let orch = SyncOrchestrator::new(
            queue.clone(),
            Arc::new(RemoteGateway::new(remote, &lenient())),
            Arc::new(ManualConnectivity::new(online)),
            RetryConfig::sync_operations(),
        );
        (orch, queue)
    }

    async fn enqueue_record(queue: &SyncQueue, key: &str) -> u64 {
        let record = Record::new(key, json!({"mbti": "INFP"}));
        queue
            .store()
            .put_record(Partition::TestData, &record)
            .await
            .unwrap();
        queue
            .enqueue(OperationKind::SaveTestData, record.to_document().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_offline_is_a_no_op() {
        let remote = Arc::new(InMemoryRemote::new());
        let (orch, queue) = orchestrator(remote.clone(), false);
        enqueue_record(&queue, "A").await;

        let outcome = orch.sync().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::Offline));
        assert!(!outcome.success());
        assert_eq!(queue.pending_count().await.unwrap(), 1);
        assert_eq!(remote.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_queue_reports_zero() {
        let (orch, _queue) = orchestrator(Arc::new(InMemoryRemote::new()), true);

        let report = *orch.sync().await.unwrap().report().unwrap();
        assert_eq!((report.synced, report.failed, report.total), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_delivered_operation_is_completed() {
        let remote = Arc::new(InMemoryRemote::new());
        let (orch, queue) = orchestrator(remote.clone(), true);
        let id = enqueue_record(&queue, "A").await;

        let report = *orch.sync().await.unwrap().report().unwrap();
        assert_eq!((report.synced, report.failed, report.total), (1, 0, 1));

        let op = queue.get(id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert!(op.metadata.contains_key("syncedAt"));
        assert!(remote.get(Partition::TestData, "A").is_some());

        let local = queue.store().get_record(Partition::TestData, "A").await.unwrap().unwrap();
        assert!(!local.has_unsynced_changes());

        // Completed operations are not visited again
        let again = *orch.sync().await.unwrap().report().unwrap();
        assert_eq!(again.total, 0);
        assert_eq!(remote.saves().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_operation_is_failed_with_backoff() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.reject_key("A");
        let (orch, queue) = orchestrator(remote.clone(), true);
        let id = enqueue_record(&queue, "A").await;

        let report = *orch.sync().await.unwrap().report().unwrap();
        assert_eq!((report.synced, report.failed, report.total), (0, 1, 1));

        let op = queue.get(id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(op.error().unwrap().contains("rejected"));
        assert_eq!(op.attempts(), 1);
        let failed_at = op.metadata["failedAt"].as_i64().unwrap();
        assert_eq!(op.next_attempt_at(), Some(failed_at + 30_000));

        // Not retried by the next run
        let again = *orch.sync().await.unwrap().report().unwrap();
        assert_eq!(again.total, 0);
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_at_dispatch() {
        let remote = Arc::new(InMemoryRemote::new());
        let (orch, queue) = orchestrator(remote.clone(), true);
        let id = queue
            .enqueue(OperationKind::Other("deleteTestData".into()), json!({"key": "A"}))
            .await
            .unwrap();

        let report = *orch.sync().await.unwrap().report().unwrap();
        assert_eq!(report.failed, 1);
        let op = queue.get(id).await.unwrap().unwrap();
        assert!(op.error().unwrap().contains("unsupported operation kind"));
        assert_eq!(remote.calls(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_operation_drops_its_schedule() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.reject_key("A");
        let queue = SyncQueue::new(Store::in_memory());
        let retry = RetryConfig {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 2.0,
            max_retries: Some(2),
        };
        let orch = SyncOrchestrator::new(
            queue.clone(),
            Arc::new(RemoteGateway::new(remote, &lenient())),
            Arc::new(ManualConnectivity::new(true)),
            retry.clone(),
        );
        let id = enqueue_record(&queue, "A").await;

        orch.sync().await.unwrap();
        assert!(queue.get(id).await.unwrap().unwrap().next_attempt_at().is_some());

        assert_eq!(queue.requeue_failed(&retry, now_millis()).await.unwrap(), 1);
        orch.sync().await.unwrap();

        let op = queue.get(id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.attempts(), 2);
        assert_eq!(op.metadata.get("nextAttemptAt"), Some(&Value::Null));
        assert!(op.next_attempt_at().is_none());
        assert!(!queue.has_undelivered(&OperationKind::SaveTestData, "A", &retry).await.unwrap());
    }

    /// Remote that, while saving one key, lets another session claim a
    /// different queued operation.
    struct ClaimingRemote {
        inner: InMemoryRemote,
        queue: SyncQueue,
        claim: u64,
    }

    #[async_trait]
    impl RemoteApi for ClaimingRemote {
        async fn save(&self, partition: Partition, record: &Record) -> Result<(), RemoteError> {
            self.queue
                .update_status(self.claim, OperationStatus::Syncing, None)
                .await
                .unwrap();
            self.inner.save(partition, record).await
        }

        async fn fetch(&self, key: &str) -> Result<Option<Record>, RemoteError> {
            self.inner.fetch(key).await
        }

        async fn fetch_all(&self, options: &FetchOptions) -> Result<Vec<Record>, RemoteError> {
            self.inner.fetch_all(options).await
        }
    }

    #[tokio::test]
    async fn test_operation_claimed_mid_run_is_skipped() {
        let queue = SyncQueue::new(Store::in_memory());
        enqueue_record(&queue, "A").await;
        let claimed = enqueue_record(&queue, "B").await;

        let remote = Arc::new(ClaimingRemote {
            inner: InMemoryRemote::new(),
            queue: queue.clone(),
            claim: claimed,
        });
        let orch = SyncOrchestrator::new(
            queue.clone(),
            Arc::new(RemoteGateway::new(remote.clone(), &lenient())),
            Arc::new(ManualConnectivity::new(true)),
            RetryConfig::sync_operations(),
        );

        let report = *orch.sync().await.unwrap().report().unwrap();
        assert_eq!((report.synced, report.failed, report.total), (1, 0, 1));
        assert_eq!(remote.inner.saves().len(), 1);
        assert_eq!(
            queue.get(claimed).await.unwrap().unwrap().status,
            OperationStatus::Syncing
        );
    }

    /// Remote whose save blocks until released.
    struct GatedRemote {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl RemoteApi for GatedRemote {
        async fn save(&self, _partition: Partition, _record: &Record) -> Result<(), RemoteError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }

        async fn fetch(&self, _key: &str) -> Result<Option<Record>, RemoteError> {
            Ok(None)
        }

        async fn fetch_all(&self, _options: &FetchOptions) -> Result<Vec<Record>, RemoteError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_overlapping_run_is_skipped() {
        let remote = Arc::new(GatedRemote {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let (orch, queue) = orchestrator(remote.clone(), true);
        enqueue_record(&queue, "A").await;

        let (first, second) = tokio::join!(orch.sync(), async {
            remote.entered.notified().await;
            assert!(orch.is_running());
            let second = orch.sync().await;
            remote.release.notify_one();
            second
        });

        assert_eq!(second.unwrap(), SyncOutcome::Skipped(SkipReason::InFlight));
        assert_eq!(first.unwrap().report().unwrap().synced, 1);
        assert!(!orch.is_running());
    }
}
