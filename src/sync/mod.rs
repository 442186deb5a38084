//! Versioned change-log sync engine
//!
//! Provides:
//! - A per-user monotonic version counter ([`VersionStore`])
//! - An append-only log of tagged changesets ([`ChangeLog`])
//! - Commit and pull orchestration ([`SyncCoordinator`])
//! - Orphan cleanup ([`Reconciler`])
//!
//! # Commit Protocol
//!
//! 1. Client sends its changeset with the version it was built on
//! 2. Server appends the changeset tagged `base + 1`
//! 3. Server moves the version `base -> base + 1` with a compare-and-swap
//! 4. On conflict the client pulls from its base, rebases and retries
//!
//! # Confirmation
//!
//! An entry is confirmed once the CAS records it as the commit of its
//! target version. Confirmed target versions of a user form the gap-free
//! sequence `1..=version`. Everything else is garbage for the reconciler.

mod change_log;
mod coordinator;
mod error;
mod memory;
mod reconciler;
mod types;
mod version_store;

pub use change_log::ChangeLog;
pub use coordinator::{CoordinatorOptions, SyncCoordinator, DEFAULT_MAX_PULL_BATCH};
pub use error::SyncError;
pub use memory::MemoryStore;
pub use reconciler::{
    ConsistencyIssue, ConsistencyReport, ReconcileSummary, Reconciler, ReconcilerStats,
    SweepReport,
};
pub use types::{
    check_transition, check_version, ChangeLogEntry, ChangeOperation, ChangeRecord, Changeset,
    CommitOutcome, EntryFilter, EntryId, EntryStatus, InspectedEntry, PullBatch, UserVersion,
    Version, INITIAL_VERSION, MAX_RECORD_ID_LEN, MAX_TABLE_NAME_LEN,
};
pub use version_store::{
    UserLockGuard, UserLocks, VersionLease, VersionStore, DEFAULT_LOCK_TIMEOUT,
};
