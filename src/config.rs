//! Configuration for the sync client.
//!
//! # Example
//!
//! ```
//! use assessment_sync::SyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert_eq!(config.sync_interval_secs, 30);
//!
//! // From the host's JSON settings; missing fields fall back to defaults
//! let config: SyncConfig = serde_json::from_str(r#"{
//!     "db_path": "/data/assessment.db",
//!     "retry": {"initial_delay": 1000, "max_delay": 60000, "factor": 2.0, "max_retries": 3}
//! }"#).unwrap();
//! assert_eq!(config.retry.max_retries, Some(3));
//! assert_eq!(config.scan_page_size, 100);
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::resilience::circuit_breaker::CircuitConfig;
use crate::resilience::retry::RetryConfig;

/// Configuration for [`crate::SyncClient`].
///
/// All fields have sensible defaults. Set `db_path` for a durable store;
/// without it the client keeps everything in memory.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// SQLite file backing the local store
    #[serde(default)]
    pub db_path: Option<String>,

    /// Periodic drain tick of the background loop (0 = disabled)
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Entries fetched per page when scanning the store
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,

    /// Backoff schedule for failed sync operations
    #[serde(default)]
    pub retry: RetryConfig,

    /// Circuit breaker around remote calls
    #[serde(default)]
    pub circuit: CircuitConfig,

    /// Completed operations older than this are pruned by the background
    /// loop (0 = keep forever)
    #[serde(default = "default_prune_completed_after_secs")]
    pub prune_completed_after_secs: u64,

    /// Failed operations out of attempts are pruned once untouched this
    /// long (0 = keep forever)
    #[serde(default = "default_prune_failed_after_secs")]
    pub prune_failed_after_secs: u64,

    /// Writes younger than this are skipped by the reconcile pass
    #[serde(default = "default_reconcile_settle_ms")]
    pub reconcile_settle_ms: u64,
}

fn default_sync_interval_secs() -> u64 { 30 }
fn default_scan_page_size() -> usize { crate::storage::DEFAULT_PAGE_SIZE }
fn default_prune_completed_after_secs() -> u64 { 7 * 24 * 60 * 60 } // 7 days
fn default_prune_failed_after_secs() -> u64 { 30 * 24 * 60 * 60 } // 30 days
fn default_reconcile_settle_ms() -> u64 { 5_000 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            sync_interval_secs: default_sync_interval_secs(),
            scan_page_size: default_scan_page_size(),
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
            prune_completed_after_secs: default_prune_completed_after_secs(),
            prune_failed_after_secs: default_prune_failed_after_secs(),
            reconcile_settle_ms: default_reconcile_settle_ms(),
        }
    }
}

impl SyncConfig {
    /// Periodic tick, if enabled.
    #[must_use]
    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
    }

    /// Retention of completed operations, if pruning is enabled.
    #[must_use]
    pub fn prune_completed_after(&self) -> Option<Duration> {
        (self.prune_completed_after_secs > 0).then(|| Duration::from_secs(self.prune_completed_after_secs))
    }

    /// Retention of failed operations with no attempts left, if pruning is
    /// enabled.
    #[must_use]
    pub fn prune_failed_after(&self) -> Option<Duration> {
        (self.prune_failed_after_secs > 0).then(|| Duration::from_secs(self.prune_failed_after_secs))
    }
}
