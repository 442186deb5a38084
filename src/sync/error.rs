//! Sync engine error types

use thiserror::Error;

use super::types::Version;

/// Errors raised by the version store, change log, coordinator and reconciler
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed or negative version, rejected before any mutation
    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    /// Changeset failed validation, rejected before any mutation
    #[error("Invalid changeset: {0}")]
    InvalidChangeset(String),

    /// Missing or malformed identifier (user id, device id)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// CAS lost the race; re-pull and retry with the fresh version
    #[error("Version conflict: current version is {current_version}")]
    VersionConflict { current_version: Version },

    /// Exclusive path could not acquire the user's lock in time
    #[error("Timed out after {waited_ms}ms waiting for version lock of user {user_id}")]
    LockTimeout { user_id: String, waited_ms: u64 },

    /// Underlying storage unavailable or failing
    #[error("Persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),

    /// Payload could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be decoded
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}

impl SyncError {
    /// Conflicts and lock timeouts are steady-state events a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::VersionConflict { .. } | SyncError::LockTimeout { .. }
        )
    }
}
