//! Append-only per-user change log

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::error::SyncError;
use super::types::{ChangeLogEntry, EntryFilter, EntryId, InspectedEntry, Version};

/// Durable append-only sequence of tagged changesets.
///
/// Entries are never mutated. Whether an entry is confirmed is derived from
/// the commit the version store recorded for its target version, never from
/// the entry itself.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Insert one entry. Duplicate or overlapping target versions are legal.
    async fn append(
        &self,
        user_id: &str,
        target_version: Version,
        payload: &str,
        device_id: &str,
    ) -> Result<EntryId, SyncError>;

    /// Confirmed entries with `since < target_version <= up_to`, ascending.
    ///
    /// The stream is lazy and finite; re-invoking with the same bounds yields
    /// the same entries.
    fn range_after<'a>(
        &'a self,
        user_id: &'a str,
        since: Version,
        up_to: Version,
    ) -> BoxStream<'a, Result<ChangeLogEntry, SyncError>>;

    /// Uncommitted entries with `target_version > confirmed`
    async fn count_above(&self, user_id: &str, confirmed: Version) -> Result<u64, SyncError>;

    /// Delete uncommitted entries with `target_version > confirmed`.
    ///
    /// Same predicate as [`ChangeLog::count_above`]. A committed entry is
    /// never deleted, so a racing successful CAS cannot lose its entry.
    async fn delete_above(&self, user_id: &str, confirmed: Version) -> Result<u64, SyncError>;

    /// Uncommitted entries with `target_version <= confirmed`
    async fn count_superseded(&self, user_id: &str, confirmed: Version)
        -> Result<u64, SyncError>;

    /// Delete uncommitted entries with `target_version <= confirmed`
    async fn delete_superseded(
        &self,
        user_id: &str,
        confirmed: Version,
    ) -> Result<u64, SyncError>;

    /// Delete one entry unless it has been committed
    async fn discard(&self, user_id: &str, entry_id: EntryId) -> Result<bool, SyncError>;

    /// Administrative inspection, ordered by user, target version, id
    async fn find(&self, filter: &EntryFilter) -> Result<Vec<InspectedEntry>, SyncError>;
}
