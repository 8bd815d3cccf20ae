//! # Assessment Sync
//!
//! An offline-first persistence and synchronization engine for assessment
//! data: saves and reads keep working without a network, and every mutation
//! eventually reaches the server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  SyncClient (access facade)                 │
//! │  • Local write first, then remote or queue                 │
//! │  • Read-through cache refresh                              │
//! │  • Observable ConnectivityState (watch channel)            │
//! └─────────────────────────────────────────────────────────────┘
//!            │                    │                   │
//!            ▼                    ▼                   ▼
//! ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐
//! │   Orchestrator   │ │    Reconciler    │ │  RemoteGateway   │
//! │  Single-flight   │ │  Watermark pass  │ │  Circuit breaker │
//! │  ordered drain   │ │  for lost queues │ │  around RemoteApi│
//! └──────────────────┘ └──────────────────┘ └──────────────────┘
//!            │                    │
//!            ▼                    ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SyncQueue                           │
//! │  • pending → syncing → completed | failed                  │
//! │  • Backoff-driven requeue, pruning, crash recovery         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Local Structured Store                  │
//! │  • Partitions: testData, syncQueue, userData, settings     │
//! │  • Secondary indexes, lazy restartable cursors             │
//! │  • SQLite (WAL mode) or in-memory backend                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use assessment_sync::{InMemoryRemote, ManualConnectivity, Record, SyncClient, SyncConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig {
//!         db_path: Some("assessment.db".into()),
//!         ..Default::default()
//!     };
//!     let connectivity = Arc::new(ManualConnectivity::new(true));
//!     let client = Arc::new(
//!         SyncClient::open(config, Arc::new(InMemoryRemote::new()), connectivity.clone())
//!             .await
//!             .expect("Failed to open store"),
//!     );
//!
//!     // Background loop: drains on reconnect and on every tick
//!     let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
//!     let worker = tokio::spawn({
//!         let client = client.clone();
//!         async move { client.run(async { let _ = stop_rx.await; }).await }
//!     });
//!
//!     client
//!         .save_record(Record::new("ABC123", json!({"mbti": "INFP"})))
//!         .await
//!         .expect("Failed to save");
//!
//!     let read = client.get_record("ABC123").await.expect("Not found");
//!     println!("{} (cached: {})", read.data.payload, read.from_cache);
//!
//!     let _ = stop_tx.send(());
//!     let _ = worker.await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`client`]: The [`SyncClient`] facade
//! - [`storage`]: Local structured store (SQLite, memory)
//! - [`queue`]: Sync queue of pending mutations
//! - [`orchestrator`]: Drain of the queue against the remote
//! - [`reconcile`]: Watermark pass that re-enqueues lost writes
//! - [`remote`]: Remote collaborator trait and gateway
//! - [`connectivity`]: Injectable connectivity signal
//! - [`resilience`]: Circuit breaker and retry policy

pub mod client;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod reconcile;
pub mod record;
pub mod remote;
pub mod resilience;
pub mod storage;

pub use client::{ConnectivityState, FetchOutcome, SaveOutcome, SyncClient};
pub use config::SyncConfig;
pub use connectivity::{Connectivity, ConnectivityEvent, ManualConnectivity};
pub use error::SyncError;
pub use orchestrator::{SkipReason, SyncOrchestrator, SyncOutcome, SyncReport};
pub use queue::{OperationKind, OperationStatus, SyncOperation, SyncQueue};
pub use reconcile::{ReconcileReport, Reconciler};
pub use record::Record;
pub use remote::{FetchOptions, InMemoryRemote, RemoteApi, RemoteError, RemoteGateway};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use resilience::retry::RetryConfig;
pub use storage::{Direction, Partition, Store, StoreError};
pub use metrics::LatencyTimer;
