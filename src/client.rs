//! Connectivity-aware access facade.
//!
//! [`SyncClient`] is the only entry point application code uses. Every write
//! lands in the local store first, so offline reads see it immediately. When
//! online the write is also sent to the remote directly; when that is not
//! possible it is queued and delivered by the orchestrator later.
//!
//! Remote failures never surface as errors from the save and read calls.
//! They come back inside [`SaveOutcome`] / [`FetchOutcome`] as a message,
//! with `online: false` meaning "saved here, will sync later" or "served
//! from the local cache".
//!
//! # Example
//!
//! ```
//! use assessment_sync::{InMemoryRemote, ManualConnectivity, Record, SyncClient, SyncConfig};
//! use assessment_sync::storage::Store;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), assessment_sync::SyncError> {
//! let connectivity = Arc::new(ManualConnectivity::new(false));
//! let client = SyncClient::new(
//!     SyncConfig::default(),
//!     Store::in_memory(),
//!     Arc::new(InMemoryRemote::new()),
//!     connectivity.clone(),
//! )
//! .await?;
//!
//! let saved = client.save_record(Record::new("ABC123", json!({"mbti": "INFP"}))).await?;
//! assert!(!saved.online);
//! assert_eq!(client.pending_operations(), 1);
//!
//! let read = client.get_record("ABC123").await?;
//! assert_eq!(read.data.payload, json!({"mbti": "INFP"}));
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::connectivity::{Connectivity, ConnectivityEvent};
use crate::error::SyncError;
use crate::orchestrator::{SyncOrchestrator, SyncOutcome, SyncReport};
use crate::queue::{OperationKind, OperationStatus, SyncQueue};
use crate::reconcile::{Reconciler, WATERMARK_KEY};
use crate::record::{now_millis, Record};
use crate::remote::{FetchOptions, RemoteApi, RemoteGateway};
use crate::storage::{Partition, ScanOptions, Store};

/// Observable connectivity and sync status, for UI consumption.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectivityState {
    pub online: bool,
    /// Operations waiting for delivery
    pub pending_operations: usize,
    /// Result of the most recent completed drain
    pub last_sync: Option<SyncReport>,
}

/// Result of a save.
///
/// The local write always succeeded when this is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub key: String,
    /// The remote confirmed the write in this call
    pub online: bool,
    /// Queue id when delivery was deferred
    pub queued: Option<u64>,
    /// Why the direct remote write failed
    pub error: Option<String>,
}

/// Result of a read.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome<T> {
    pub data: T,
    /// The remote answered this call
    pub online: bool,
    /// Served from the local store
    pub from_cache: bool,
    /// Why the remote could not be used
    pub error: Option<String>,
}

impl<T> FetchOutcome<T> {
    fn remote(data: T) -> Self {
        Self {
            data,
            online: true,
            from_cache: false,
            error: None,
        }
    }

    fn cached(data: T, error: Option<String>) -> Self {
        Self {
            data,
            online: false,
            from_cache: true,
            error,
        }
    }
}

/// Offline-first access to assessment data.
pub struct SyncClient {
    config: SyncConfig,
    store: Store,
    queue: SyncQueue,
    remote: Arc<RemoteGateway>,
    connectivity: Arc<dyn Connectivity>,
    orchestrator: SyncOrchestrator,
    reconciler: Reconciler,
    state: watch::Sender<ConnectivityState>,
}

impl SyncClient {
    /// Build a client over an opened store.
    ///
    /// Operations left in `syncing` by an interrupted session are returned to
    /// `pending` before anything else runs.
    pub async fn new(
        config: SyncConfig,
        store: Store,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Result<Self, SyncError> {
        let store = store.with_page_size(config.scan_page_size);
        let queue = SyncQueue::new(store.clone());
        let remote = Arc::new(RemoteGateway::new(remote, &config.circuit));
        let orchestrator = SyncOrchestrator::new(
            queue.clone(),
            remote.clone(),
            connectivity.clone(),
            config.retry.clone(),
        );
        let reconciler =
            Reconciler::new(queue.clone()).with_settle_millis(config.reconcile_settle_ms as i64);

        let recovered = queue.recover_stale().await?;
        let pending = queue.pending_count().await?;
        let online = connectivity.is_online();
        let (state, _rx) = watch::channel(ConnectivityState {
            online,
            pending_operations: pending,
            last_sync: None,
        });

        info!(online, pending, recovered, "Sync client ready");
        crate::metrics::set_online(online);
        crate::metrics::set_pending_operations(pending);

        Ok(Self {
            config,
            store,
            queue,
            remote,
            connectivity,
            orchestrator,
            reconciler,
            state,
        })
    }

    /// Open the store named by `config.db_path` (in memory when unset) and
    /// build a client over it.
    pub async fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Result<Self, SyncError> {
        let store = match &config.db_path {
            Some(path) => Store::open(path).await?,
            None => Store::in_memory(),
        };
        Self::new(config, store, remote, connectivity).await
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    #[must_use]
    pub fn remote(&self) -> &RemoteGateway {
        &self.remote
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TEST DATA
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a test result locally and deliver it now or later.
    #[tracing::instrument(skip(self, record), fields(key = %record.key))]
    pub async fn save_record(&self, record: Record) -> Result<SaveOutcome, SyncError> {
        let _timer = crate::metrics::LatencyTimer::new("client", "save_record");
        self.save_delivered(Partition::TestData, OperationKind::SaveTestData, record)
            .await
    }

    /// Read a test result, remote first when online.
    ///
    /// Absent both remotely and locally is [`SyncError::NotFound`].
    #[tracing::instrument(skip(self))]
    pub async fn get_record(&self, key: &str) -> Result<FetchOutcome<Record>, SyncError> {
        let _timer = crate::metrics::LatencyTimer::new("client", "get_record");

        let error = if self.connectivity.is_online() {
            match self.remote.fetch(key).await {
                Ok(Some(fetched)) => {
                    let (record, kept_local) = self.refresh_cached(Partition::TestData, fetched).await?;
                    crate::metrics::record_operation("client", "get_record", "remote");
                    return Ok(if kept_local {
                        FetchOutcome {
                            from_cache: true,
                            ..FetchOutcome::remote(record)
                        }
                    } else {
                        FetchOutcome::remote(record)
                    });
                }
                Ok(None) => Some(format!("'{}' not found on remote", key)),
                Err(e) => {
                    warn!(error = %e, "Remote fetch failed, reading local copy");
                    Some(e.to_string())
                }
            }
        } else {
            None
        };

        let record = self
            .store
            .get_record(Partition::TestData, key)
            .await?
            .ok_or_else(|| SyncError::NotFound(key.to_string()))?;
        crate::metrics::record_fallback("get_record", "cache");
        Ok(FetchOutcome::cached(record, error))
    }

    /// Read a collection of test results, remote first when online.
    ///
    /// Remote results are upserted into the local store one by one.
    #[tracing::instrument(skip(self))]
    pub async fn get_all_records(&self, options: FetchOptions) -> Result<FetchOutcome<Vec<Record>>, SyncError> {
        let _timer = crate::metrics::LatencyTimer::new("client", "get_all_records");

        let error = if self.connectivity.is_online() {
            match self.remote.fetch_all(&options).await {
                Ok(fetched) => {
                    let mut records = Vec::with_capacity(fetched.len());
                    for record in fetched {
                        records.push(self.refresh_cached(Partition::TestData, record).await?.0);
                    }
                    return Ok(FetchOutcome::remote(records));
                }
                Err(e) => {
                    warn!(error = %e, "Remote fetch_all failed, scanning local store");
                    Some(e.to_string())
                }
            }
        } else {
            None
        };

        let records = self.scan_local(&options).await?;
        crate::metrics::record_fallback("get_all_records", "cache");
        Ok(FetchOutcome::cached(records, error))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // USER DATA & SETTINGS
    // ═══════════════════════════════════════════════════════════════════════

    /// Save user data locally and deliver it now or later.
    #[tracing::instrument(skip(self, payload))]
    pub async fn save_user_data(&self, user_id: &str, payload: Value) -> Result<SaveOutcome, SyncError> {
        self.save_delivered(
            Partition::UserData,
            OperationKind::SaveUserData,
            Record::new(user_id, payload),
        )
        .await
    }

    pub async fn get_user_data(&self, user_id: &str) -> Result<Option<Record>, SyncError> {
        Ok(self.store.get_record(Partition::UserData, user_id).await?)
    }

    /// Store a device-local setting. Settings are never sent to the remote.
    pub async fn save_setting(&self, name: &str, value: Value) -> Result<Record, SyncError> {
        if name == WATERMARK_KEY {
            return Err(SyncError::InvalidRecord(format!("setting '{}' is reserved", name)));
        }
        Ok(self
            .store
            .write_record(Partition::Settings, &Record::new(name, value))
            .await?)
    }

    pub async fn get_setting(&self, name: &str) -> Result<Option<Value>, SyncError> {
        Ok(self
            .store
            .get_record(Partition::Settings, name)
            .await?
            .map(|r| r.payload))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SYNC & STATUS
    // ═══════════════════════════════════════════════════════════════════════

    /// Drain the queue once, then refresh the observable state.
    pub async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        let outcome = self.orchestrator.sync().await?;
        if let SyncOutcome::Completed(report) = outcome {
            self.state.send_modify(|state| state.last_sync = Some(report));
        }
        self.refresh_pending().await?;
        Ok(outcome)
    }

    /// Operations waiting for delivery, as of the last save or sync.
    #[must_use]
    pub fn pending_operations(&self) -> usize {
        self.state.borrow().pending_operations
    }

    #[must_use]
    pub fn status(&self) -> ConnectivityState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// React to a connectivity transition. Coming online triggers one drain,
    /// whose outcome is returned.
    #[tracing::instrument(skip(self))]
    pub async fn handle_connectivity(&self, event: ConnectivityEvent) -> Result<Option<SyncOutcome>, SyncError> {
        let online = event == ConnectivityEvent::BecameOnline;
        self.state.send_modify(|state| state.online = online);
        crate::metrics::set_online(online);
        info!(%event, "Connectivity transition");

        if online {
            Ok(Some(self.sync().await?))
        } else {
            Ok(None)
        }
    }

    /// Periodic housekeeping: requeue failed operations whose backoff
    /// elapsed, reconcile unqueued local writes, drain, then prune old
    /// completed operations and old failures with no attempts left.
    pub async fn tick(&self) -> Result<SyncOutcome, SyncError> {
        let now = now_millis();
        self.queue.requeue_failed(&self.config.retry, now).await?;
        self.reconciler.reconcile().await?;
        let outcome = self.sync().await?;

        if let Some(retention) = self.config.prune_completed_after() {
            let cutoff = now - retention.as_millis() as i64;
            self.queue.prune(OperationStatus::Completed, cutoff).await?;
        }
        if let Some(retention) = self.config.prune_failed_after() {
            let cutoff = now - retention.as_millis() as i64;
            self.queue.prune_exhausted(&self.config.retry, cutoff).await?;
        }
        Ok(outcome)
    }

    /// Run the background loop until `shutdown` resolves.
    ///
    /// Drains once on every offline→online transition and runs [`Self::tick`]
    /// on the configured interval (the first tick fires immediately).
    #[tracing::instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut connectivity_rx = self.connectivity.subscribe();
        connectivity_rx.borrow_and_update();

        let mut interval = self.config.sync_interval().map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        info!("Sync client running");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Sync client stopping");
                    break;
                }

                Ok(()) = connectivity_rx.changed() => {
                    let online = *connectivity_rx.borrow_and_update();
                    if let Err(e) = self.handle_connectivity(ConnectivityEvent::from_online(online)).await {
                        error!(error = %e, "Sync after connectivity change failed");
                    }
                }

                _ = next_tick(&mut interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Periodic sync failed");
                    }
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INTERNALS
    // ═══════════════════════════════════════════════════════════════════════

    async fn save_delivered(
        &self,
        partition: Partition,
        kind: OperationKind,
        record: Record,
    ) -> Result<SaveOutcome, SyncError> {
        if record.key.trim().is_empty() {
            return Err(SyncError::InvalidRecord(format!("{}: record key is empty", partition)));
        }
        let mut stored = self.store.write_record(partition, &record).await?;
        let key = stored.key.clone();

        // A direct write must not overtake earlier writes still in the queue
        let online = self.connectivity.is_online()
            && !self.queue.has_undelivered(&kind, &key, &self.config.retry).await?;

        let outcome = if online {
            match self.remote.save(partition, &stored).await {
                Ok(()) => {
                    stored.synced_at = Some(now_millis().max(stored.last_modified));
                    self.store.put_record(partition, &stored).await?;
                    crate::metrics::record_operation("client", "save", "remote");
                    SaveOutcome {
                        key,
                        online: true,
                        queued: None,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Remote save failed, queueing");
                    let id = self.queue.enqueue(kind, stored.to_document()?).await?;
                    crate::metrics::record_fallback("save", "queue");
                    SaveOutcome {
                        key,
                        online: false,
                        queued: Some(id),
                        error: Some(e.to_string()),
                    }
                }
            }
        } else {
            let id = self.queue.enqueue(kind, stored.to_document()?).await?;
            debug!(key = %key, id, "Queued for later delivery");
            crate::metrics::record_fallback("save", "queue");
            SaveOutcome {
                key,
                online: false,
                queued: Some(id),
                error: None,
            }
        };

        self.refresh_pending().await?;
        Ok(outcome)
    }

    /// Upsert a remote copy into the local store. A local copy with
    /// unsynced changes is newer than anything the remote has and is kept;
    /// the flag says which one was returned.
    async fn refresh_cached(&self, partition: Partition, fetched: Record) -> Result<(Record, bool), SyncError> {
        if let Some(local) = self.store.get_record(partition, &fetched.key).await? {
            if local.has_unsynced_changes() {
                debug!(key = %local.key, "Keeping local copy with unsynced changes");
                return Ok((local, true));
            }
        }

        let mut record = fetched;
        record.synced_at = Some(now_millis().max(record.last_modified));
        Ok((self.store.put_record(partition, &record).await?, false))
    }

    async fn scan_local(&self, options: &FetchOptions) -> Result<Vec<Record>, SyncError> {
        let filter_options = options.clone();
        let scan = ScanOptions::by_index("timestamp")
            .direction(options.direction)
            .filter(move |r: &Record| filter_options.matches(&r.key));
        let mut cursor = self.store.scan::<Record>(Partition::TestData, scan);

        let limit = options.limit.unwrap_or(usize::MAX);
        let mut records = Vec::new();
        while records.len() < limit {
            let Some(record) = cursor.next().await? else {
                break;
            };
            records.push(record);
        }
        Ok(records)
    }

    async fn refresh_pending(&self) -> Result<(), SyncError> {
        let pending = self.queue.pending_count().await?;
        self.state.send_if_modified(|state| {
            let changed = state.pending_operations != pending;
            state.pending_operations = pending;
            changed
        });
        crate::metrics::set_pending_operations(pending);
        Ok(())
    }
}

/// Next tick of an optional interval; never resolves when disabled.
async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
