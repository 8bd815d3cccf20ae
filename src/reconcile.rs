//! Reconciliation pass.
//!
//! Saving a record and enqueueing its delivery are two separate local
//! transactions; a crash between them leaves a record that nothing will
//! ever deliver. The reconciler finds such records by comparing
//! `lastModified` against a watermark and enqueues the missing operations.
//!
//! A record is covered when the remote confirmed its current version
//! (`syncedAt >= lastModified`) or when a queued operation for its key was
//! enqueued at or after its last write, whatever that operation's status.
//! Failed operations are the business of [`crate::queue::SyncQueue::requeue_failed`].

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info};

use crate::error::SyncError;
use crate::queue::{OperationKind, SyncQueue};
use crate::record::{now_millis, Record};
use crate::storage::{Partition, ScanOptions, Store};

/// Settings entry holding the reconcile watermark (epoch millis).
pub const WATERMARK_KEY: &str = "sync.watermark";

/// Records written more recently than this are left to the save in flight.
pub const DEFAULT_SETTLE_MILLIS: i64 = 5_000;

/// Partitions whose records are delivered to the remote.
const DELIVERED: [(Partition, OperationKind); 2] = [
    (Partition::TestData, OperationKind::SaveTestData),
    (Partition::UserData, OperationKind::SaveUserData),
];

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    /// Records modified since the previous watermark
    pub scanned: usize,
    /// Operations enqueued for uncovered records
    pub enqueued: usize,
    /// Watermark stored for the next pass
    pub watermark: i64,
}

pub struct Reconciler {
    store: Store,
    queue: SyncQueue,
    settle_millis: i64,
}

impl Reconciler {
    pub fn new(queue: SyncQueue) -> Self {
        Self {
            store: queue.store().clone(),
            queue,
            settle_millis: DEFAULT_SETTLE_MILLIS,
        }
    }

    #[must_use]
    pub fn with_settle_millis(mut self, settle_millis: i64) -> Self {
        self.settle_millis = settle_millis.max(0);
        self
    }

    /// Current watermark; 0 before the first pass.
    pub async fn watermark(&self) -> Result<i64, SyncError> {
        Ok(self
            .store
            .get_record(Partition::Settings, WATERMARK_KEY)
            .await?
            .and_then(|r| r.payload.as_i64())
            .unwrap_or(0))
    }

    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport, SyncError> {
        let watermark = self.watermark().await?;
        let horizon = now_millis() - self.settle_millis;
        let mut report = ReconcileReport {
            watermark: horizon.max(watermark),
            ..ReconcileReport::default()
        };

        let mut unsynced = Vec::new();
        for (partition, kind) in DELIVERED {
            let mut cursor = self
                .store
                .scan::<Record>(partition, ScanOptions::by_index("lastModified").descending());

            while let Some(record) = cursor.next().await? {
                if record.last_modified < watermark {
                    break;
                }
                if record.last_modified > horizon {
                    continue;
                }
                report.scanned += 1;
                if record.has_unsynced_changes() {
                    unsynced.push((partition, kind.clone(), record));
                }
            }
        }

        // Only operations enqueued after the oldest candidate's last write can cover it
        if let Some(oldest) = unsynced.iter().map(|(_, _, r)| r.last_modified).min() {
            let latest_enqueue = self.latest_enqueue_by_key(oldest).await?;
            for (partition, kind, record) in unsynced {
                let queued = latest_enqueue
                    .get(&(kind.clone(), record.key.clone()))
                    .is_some_and(|enqueued_at| *enqueued_at >= record.last_modified);
                if queued {
                    continue;
                }

                debug!(partition = %partition, key = %record.key, "Enqueueing unsynced record");
                self.queue.enqueue(kind, record.to_document()?).await?;
                report.enqueued += 1;
            }
        }

        self.store
            .put_record(
                Partition::Settings,
                &Record::new(WATERMARK_KEY, Value::from(report.watermark)),
            )
            .await?;

        if report.enqueued > 0 {
            info!(enqueued = report.enqueued, scanned = report.scanned, "Reconcile enqueued unsynced records");
        }
        crate::metrics::record_reconcile(report.enqueued);
        Ok(report)
    }

    /// Most recent enqueue time per delivered key, over operations enqueued
    /// at or after `since`.
    async fn latest_enqueue_by_key(&self, since: i64) -> Result<HashMap<(OperationKind, String), i64>, SyncError> {
        let mut latest = HashMap::new();
        for op in self.queue.list_enqueued_since(since).await? {
            let Some(key) = op.record_key() else {
                continue;
            };
            let entry = latest.entry((op.kind.clone(), key.to_string())).or_insert(op.timestamp);
            *entry = (*entry).max(op.timestamp);
        }
        Ok(latest)
    }
}
