//! Sync data types
//!
//! Defines the values flowing through the engine:
//! - Versions and change log entries
//! - Changesets and their validation
//! - Commit / pull results and administrative listings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::SyncError;

/// Per-user confirmed version counter value
pub type Version = i64;

/// Version of a user that has never committed anything
pub const INITIAL_VERSION: Version = 0;

/// Longest record id accepted in a change record
pub const MAX_RECORD_ID_LEN: usize = 131;

/// Longest table name accepted in a change record
pub const MAX_TABLE_NAME_LEN: usize = 50;

/// Store-assigned, monotonically increasing change log entry id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub i64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One immutable change log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: EntryId,
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Version this entry becomes once its commit succeeds
    #[serde(rename = "targetVersion")]
    pub target_version: Version,
    /// Serialized changeset, opaque to the store
    pub payload: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Kind of mutation a change record carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
    BatchDelete,
}

/// A single row-level change produced by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub operation: ChangeOperation,
    pub table: String,
    #[serde(rename = "recordId")]
    pub record_id: String,
    pub record: Value,
}

impl ChangeRecord {
    fn validate(&self) -> Result<(), SyncError> {
        if self.table.is_empty() || self.table.len() > MAX_TABLE_NAME_LEN {
            return Err(SyncError::InvalidChangeset(format!(
                "table name must be 1..={} characters, got {:?}",
                MAX_TABLE_NAME_LEN, self.table
            )));
        }
        if self.record_id.is_empty() || self.record_id.chars().count() > MAX_RECORD_ID_LEN {
            return Err(SyncError::InvalidChangeset(format!(
                "record id for table {} must be 1..={} characters",
                self.table, MAX_RECORD_ID_LEN
            )));
        }
        Ok(())
    }
}

/// A client changeset.
///
/// The engine treats the content as opaque JSON. When the changeset is an
/// array it must be a list of [`ChangeRecord`]s and each record is validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Changeset(pub Value);

impl Changeset {
    /// Build a changeset from typed change records
    pub fn from_records(records: &[ChangeRecord]) -> Result<Self, SyncError> {
        Ok(Self(serde_json::to_value(records)?))
    }

    /// Decode the typed records of an array changeset
    pub fn records(&self) -> Option<Result<Vec<ChangeRecord>, SyncError>> {
        match &self.0 {
            Value::Array(_) => Some(
                serde_json::from_value(self.0.clone()).map_err(|e| {
                    SyncError::InvalidChangeset(format!("malformed change record: {}", e))
                }),
            ),
            _ => None,
        }
    }

    /// Reject empty changesets and malformed change records
    pub fn validate(&self) -> Result<(), SyncError> {
        match &self.0 {
            Value::Null => Err(SyncError::InvalidChangeset("changeset is empty".to_string())),
            Value::Array(items) if items.is_empty() => Err(SyncError::InvalidChangeset(
                "changeset has no records".to_string(),
            )),
            _ => match self.records() {
                Some(records) => records?.iter().try_for_each(ChangeRecord::validate),
                None => Ok(()),
            },
        }
    }

    /// Serialize for storage in the change log
    pub fn to_payload(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(&self.0)?)
    }
}

/// Result of a commit attempt.
///
/// A conflict is an expected outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CommitOutcome {
    Committed {
        #[serde(rename = "newVersion")]
        new_version: Version,
    },
    Conflict {
        #[serde(rename = "currentVersion")]
        current_version: Version,
    },
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed { .. })
    }

    /// Map a conflict to [`SyncError::VersionConflict`]
    pub fn into_result(self) -> Result<Version, SyncError> {
        match self {
            CommitOutcome::Committed { new_version } => Ok(new_version),
            CommitOutcome::Conflict { current_version } => {
                Err(SyncError::VersionConflict { current_version })
            }
        }
    }
}

/// Ordered catch-up batch returned by a pull
#[derive(Debug, Clone, PartialEq)]
pub struct PullBatch {
    /// Version the client is at after applying `changes`
    pub current_version: Version,
    /// Confirmed entries, ascending by target version
    pub changes: Vec<ChangeLogEntry>,
    /// Batch was truncated; pull again from `current_version`
    pub has_more: bool,
    /// Incremental catch-up cannot be trusted; the client should fully resync
    pub resync_required: bool,
}

/// Administrative (user, version) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserVersion {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub version: Version,
}

/// Confirmation status of a change log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Recorded commit of its target version
    Confirmed,
    /// Target version above the confirmed version and never committed
    Orphaned,
    /// Never committed and its target version has been taken by another entry
    Superseded,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Confirmed => "confirmed",
            EntryStatus::Orphaned => "orphaned",
            EntryStatus::Superseded => "superseded",
        }
    }

    /// Status of an entry that is not a recorded commit
    pub fn unconfirmed(target_version: Version, confirmed_version: Version) -> Self {
        if target_version > confirmed_version {
            EntryStatus::Orphaned
        } else {
            EntryStatus::Superseded
        }
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(EntryStatus::Confirmed),
            "orphaned" => Ok(EntryStatus::Orphaned),
            "superseded" => Ok(EntryStatus::Superseded),
            other => Err(SyncError::InvalidArgument(format!(
                "unknown entry status: {}",
                other
            ))),
        }
    }
}

/// Typed criteria for inspecting change log entries.
///
/// Unset fields do not constrain the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub min_version: Option<Version>,
    pub max_version: Option<Version>,
    pub status: Option<EntryStatus>,
    pub limit: Option<u32>,
}

impl EntryFilter {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether an entry with the given status satisfies every set criterion
    pub fn matches(&self, entry: &ChangeLogEntry, status: EntryStatus) -> bool {
        self.user_id.as_deref().map_or(true, |u| u == entry.user_id)
            && self.device_id.as_deref().map_or(true, |d| d == entry.device_id)
            && self.min_version.map_or(true, |v| entry.target_version >= v)
            && self.max_version.map_or(true, |v| entry.target_version <= v)
            && self.status.map_or(true, |s| s == status)
    }
}

/// An entry together with its derived status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InspectedEntry {
    #[serde(flatten)]
    pub entry: ChangeLogEntry,
    pub status: EntryStatus,
}

/// Reject versions below [`INITIAL_VERSION`]
pub fn check_version(version: Version) -> Result<(), SyncError> {
    if version < INITIAL_VERSION {
        return Err(SyncError::InvalidVersion(format!(
            "version {} is below the initial version {}",
            version, INITIAL_VERSION
        )));
    }
    Ok(())
}

/// A CAS may only move a version forward
pub fn check_transition(expected: Version, new_value: Version) -> Result<(), SyncError> {
    check_version(expected)?;
    if new_value <= expected {
        return Err(SyncError::InvalidVersion(format!(
            "version must advance, got {} -> {}",
            expected, new_value
        )));
    }
    Ok(())
}
