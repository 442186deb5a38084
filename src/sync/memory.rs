//! In-memory sync store
//!
//! Implements [`VersionStore`] and [`ChangeLog`] over one shared state so
//! the CAS and the log agree atomically. Used by tests and embedded callers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;

use super::change_log::ChangeLog;
use super::error::SyncError;
use super::types::{
    check_transition, ChangeLogEntry, EntryFilter, EntryId, EntryStatus, InspectedEntry,
    UserVersion, Version, INITIAL_VERSION,
};
use super::version_store::{UserLocks, VersionStore};

#[derive(Debug, Clone)]
struct VersionRow {
    version: Version,
    head_entry_id: Option<EntryId>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    versions: HashMap<String, VersionRow>,
    /// Per user: confirmed version -> entry that committed it
    commits: HashMap<String, BTreeMap<Version, EntryId>>,
    entries: BTreeMap<EntryId, ChangeLogEntry>,
    next_entry_id: i64,
}

impl MemoryState {
    fn is_committed(&self, entry: &ChangeLogEntry) -> bool {
        self.commits
            .get(&entry.user_id)
            .and_then(|c| c.get(&entry.target_version))
            == Some(&entry.id)
    }

    fn confirmed_version(&self, user_id: &str) -> Version {
        self.versions
            .get(user_id)
            .map_or(INITIAL_VERSION, |row| row.version)
    }

    fn status_of(&self, entry: &ChangeLogEntry) -> EntryStatus {
        if self.is_committed(entry) {
            EntryStatus::Confirmed
        } else {
            EntryStatus::unconfirmed(entry.target_version, self.confirmed_version(&entry.user_id))
        }
    }

    fn uncommitted_ids<F>(&self, user_id: &str, predicate: F) -> Vec<EntryId>
    where
        F: Fn(Version) -> bool,
    {
        self.entries
            .values()
            .filter(|e| e.user_id == user_id && predicate(e.target_version))
            .filter(|e| !self.is_committed(e))
            .map(|e| e.id)
            .collect()
    }

    fn remove_all(&mut self, ids: &[EntryId]) -> u64 {
        ids.iter()
            .filter(|id| self.entries.remove(*id).is_some())
            .count() as u64
    }
}

/// Sync store held entirely in memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    locks: UserLocks,
}

impl MemoryStore {
    pub fn new(locks: UserLocks) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            locks,
        }
    }

    /// Number of stored entries across all users
    pub fn entry_count(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Number of version rows
    pub fn user_count(&self) -> usize {
        self.state.read().versions.len()
    }

    /// Last update time of a user's version row
    pub fn updated_at(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.state.read().versions.get(user_id).map(|r| r.updated_at)
    }

    /// Entry that produced the user's current version
    pub fn head_entry(&self, user_id: &str) -> Option<EntryId> {
        self.state
            .read()
            .versions
            .get(user_id)
            .and_then(|r| r.head_entry_id)
    }
}

#[async_trait]
impl VersionStore for MemoryStore {
    fn locks(&self) -> &UserLocks {
        &self.locks
    }

    async fn read(&self, user_id: &str) -> Result<Version, SyncError> {
        Ok(self.state.read().confirmed_version(user_id))
    }

    async fn compare_and_swap(
        &self,
        user_id: &str,
        expected: Version,
        new_value: Version,
        entry_id: EntryId,
    ) -> Result<bool, SyncError> {
        check_transition(expected, new_value)?;

        let mut guard = self.state.write();
        let state = &mut *guard;

        let entry_matches = state
            .entries
            .get(&entry_id)
            .map_or(false, |e| e.user_id == user_id && e.target_version == new_value);

        let row = match state.versions.get_mut(user_id) {
            Some(row) if row.version == expected && entry_matches => row,
            _ => return Ok(false),
        };
        row.version = new_value;
        row.head_entry_id = Some(entry_id);
        row.updated_at = Utc::now();

        state
            .commits
            .entry(user_id.to_string())
            .or_default()
            .insert(new_value, entry_id);

        Ok(true)
    }

    async fn ensure_exists(&self, user_id: &str) -> Result<(), SyncError> {
        self.state
            .write()
            .versions
            .entry(user_id.to_string())
            .or_insert_with(|| VersionRow {
                version: INITIAL_VERSION,
                head_entry_id: None,
                updated_at: Utc::now(),
            });
        Ok(())
    }

    async fn list_versions(&self) -> Result<Vec<UserVersion>, SyncError> {
        let mut versions: Vec<UserVersion> = self
            .state
            .read()
            .versions
            .iter()
            .map(|(user_id, row)| UserVersion {
                user_id: user_id.clone(),
                version: row.version,
            })
            .collect();
        versions.sort_by(|a, b| {
            b.version
                .cmp(&a.version)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        Ok(versions)
    }
}

#[async_trait]
impl ChangeLog for MemoryStore {
    async fn append(
        &self,
        user_id: &str,
        target_version: Version,
        payload: &str,
        device_id: &str,
    ) -> Result<EntryId, SyncError> {
        let mut state = self.state.write();
        state.next_entry_id += 1;
        let id = EntryId(state.next_entry_id);
        state.entries.insert(
            id,
            ChangeLogEntry {
                id,
                user_id: user_id.to_string(),
                target_version,
                payload: payload.to_string(),
                device_id: device_id.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    fn range_after<'a>(
        &'a self,
        user_id: &'a str,
        since: Version,
        up_to: Version,
    ) -> BoxStream<'a, Result<ChangeLogEntry, SyncError>> {
        // Walks the commit index one version at a time; nothing is buffered.
        stream::unfold(since, move |cursor| async move {
            if cursor >= up_to {
                return None;
            }
            let next = {
                let state = self.state.read();
                state
                    .commits
                    .get(user_id)
                    .and_then(|commits| commits.range(cursor + 1..=up_to).next())
                    .and_then(|(_, id)| state.entries.get(id).cloned())
            };
            next.map(|entry| {
                let cursor = entry.target_version;
                (Ok(entry), cursor)
            })
        })
        .boxed()
    }

    async fn count_above(&self, user_id: &str, confirmed: Version) -> Result<u64, SyncError> {
        let state = self.state.read();
        Ok(state.uncommitted_ids(user_id, |v| v > confirmed).len() as u64)
    }

    async fn delete_above(&self, user_id: &str, confirmed: Version) -> Result<u64, SyncError> {
        let mut state = self.state.write();
        let ids = state.uncommitted_ids(user_id, |v| v > confirmed);
        Ok(state.remove_all(&ids))
    }

    async fn count_superseded(
        &self,
        user_id: &str,
        confirmed: Version,
    ) -> Result<u64, SyncError> {
        let state = self.state.read();
        Ok(state.uncommitted_ids(user_id, |v| v <= confirmed).len() as u64)
    }

    async fn delete_superseded(
        &self,
        user_id: &str,
        confirmed: Version,
    ) -> Result<u64, SyncError> {
        let mut state = self.state.write();
        let ids = state.uncommitted_ids(user_id, |v| v <= confirmed);
        Ok(state.remove_all(&ids))
    }

    async fn discard(&self, user_id: &str, entry_id: EntryId) -> Result<bool, SyncError> {
        let mut state = self.state.write();
        let removable = state
            .entries
            .get(&entry_id)
            .map_or(false, |e| e.user_id == user_id && !state.is_committed(e));
        if removable {
            state.entries.remove(&entry_id);
        }
        Ok(removable)
    }

    async fn find(&self, filter: &EntryFilter) -> Result<Vec<InspectedEntry>, SyncError> {
        let state = self.state.read();
        let mut found: Vec<InspectedEntry> = state
            .entries
            .values()
            .map(|entry| InspectedEntry {
                status: state.status_of(entry),
                entry: entry.clone(),
            })
            .filter(|inspected| filter.matches(&inspected.entry, inspected.status))
            .collect();

        found.sort_by(|a, b| {
            a.entry
                .user_id
                .cmp(&b.entry.user_id)
                .then(a.entry.target_version.cmp(&b.entry.target_version))
                .then(a.entry.id.cmp(&b.entry.id))
        });
        if let Some(limit) = filter.limit {
            found.truncate(limit as usize);
        }
        Ok(found)
    }
}
