use thiserror::Error;

use crate::storage::StoreError;

/// Errors surfaced by the queue, the orchestrator and [`crate::SyncClient`].
///
/// Remote failures never appear here: the client absorbs them into a cache
/// fallback or a queued operation and reports the message in its result
/// structs.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Local store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    /// Queue consistency error; indicates a bug
    #[error("Sync operation {0} not found")]
    OperationNotFound(u64),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => SyncError::StoreUnavailable(msg),
            StoreError::InvalidRecord(msg) => SyncError::InvalidRecord(msg),
            corrupt @ StoreError::Corrupt { .. } => SyncError::Serialization(corrupt.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}
