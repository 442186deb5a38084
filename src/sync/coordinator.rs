//! Commit and pull orchestration
//!
//! Write path per attempt:
//!
//! ```text
//! Start -> VersionRead -> Append -> CasAttempt -> Committed | Conflict
//! ```
//!
//! The changeset is appended before the CAS. A failed or interrupted CAS
//! leaves an unconfirmed entry behind: the loser discards its own entry
//! right away and the [`Reconciler`](super::Reconciler) reclaims whatever
//! is left. The engine never retries a conflict itself.

use std::sync::Arc;

use futures::TryStreamExt;
use tracing::{debug, info, warn};

use crate::context::RequestContext;

use super::change_log::ChangeLog;
use super::error::SyncError;
use super::types::{
    check_version, ChangeLogEntry, Changeset, CommitOutcome, EntryId, PullBatch, Version,
};
use super::version_store::VersionStore;

/// Default cap on entries returned by one pull
pub const DEFAULT_MAX_PULL_BATCH: usize = 1000;

/// Tunables of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// Most entries returned by one pull
    pub max_pull_batch: usize,
    /// Lag (in versions) beyond which a pull asks the client to fully resync
    pub resync_threshold: Option<u64>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            max_pull_batch: DEFAULT_MAX_PULL_BATCH,
            resync_threshold: None,
        }
    }
}

/// Orchestrates commits and catch-up pulls over a version store and a change log
#[derive(Clone)]
pub struct SyncCoordinator {
    versions: Arc<dyn VersionStore>,
    log: Arc<dyn ChangeLog>,
    options: CoordinatorOptions,
}

impl SyncCoordinator {
    pub fn new(
        versions: Arc<dyn VersionStore>,
        log: Arc<dyn ChangeLog>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            versions,
            log,
            options,
        }
    }

    /// Build over one backend implementing both traits
    pub fn from_store<S>(store: Arc<S>, options: CoordinatorOptions) -> Self
    where
        S: VersionStore + ChangeLog + 'static,
    {
        Self::new(store.clone(), store, options)
    }

    pub fn options(&self) -> CoordinatorOptions {
        self.options
    }

    /// Current confirmed version of a user (plain read)
    pub async fn current_version(&self, user_id: &str) -> Result<Version, SyncError> {
        check_user(user_id)?;
        self.versions.read(user_id).await
    }

    /// Commit a changeset on top of `base_version` through the lock-free CAS path.
    ///
    /// Returns `Conflict` when another writer got there first; the caller
    /// must pull from `base_version`, rebase and retry with the fresh version.
    pub async fn commit(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        device_id: &str,
        base_version: Version,
        changeset: &Changeset,
    ) -> Result<CommitOutcome, SyncError> {
        let (new_version, payload) = prepare(user_id, device_id, base_version, changeset)?;

        self.versions.ensure_exists(user_id).await?;

        let observed = self.versions.read(user_id).await?;
        if observed != base_version {
            debug!(
                request_id = %ctx.request_id,
                user_id = %user_id,
                base_version,
                observed,
                "Stale base version, skipping append"
            );
            return Ok(CommitOutcome::Conflict {
                current_version: observed,
            });
        }

        let entry_id = self
            .log
            .append(user_id, new_version, &payload, device_id)
            .await?;

        if self
            .versions
            .compare_and_swap(user_id, base_version, new_version, entry_id)
            .await?
        {
            info!(
                request_id = %ctx.request_id,
                user_id = %user_id,
                device_id = %device_id,
                entry_id = %entry_id,
                "Version {} -> {} committed in {}ms",
                base_version,
                new_version,
                ctx.elapsed_ms()
            );
            return Ok(CommitOutcome::Committed { new_version });
        }

        self.conflict_after_lost_cas(ctx, user_id, base_version, entry_id)
            .await
    }

    /// Commit through the exclusive lock path.
    ///
    /// Serializes with every other exclusive writer of the same user and
    /// may fail with `LockTimeout`. Lock-free writers can still win the
    /// CAS, which is then reported as a conflict.
    pub async fn commit_exclusive(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        device_id: &str,
        base_version: Version,
        changeset: &Changeset,
    ) -> Result<CommitOutcome, SyncError> {
        let (new_version, payload) = prepare(user_id, device_id, base_version, changeset)?;

        self.versions.ensure_exists(user_id).await?;

        let lease = self.versions.read_for_update(user_id).await?;
        if lease.version() != base_version {
            debug!(
                request_id = %ctx.request_id,
                user_id = %user_id,
                base_version,
                locked_version = lease.version(),
                "Stale base version under lock"
            );
            return Ok(CommitOutcome::Conflict {
                current_version: lease.version(),
            });
        }

        let entry_id = self
            .log
            .append(user_id, new_version, &payload, device_id)
            .await?;
        let swapped = self
            .versions
            .compare_and_swap(user_id, base_version, new_version, entry_id)
            .await?;
        drop(lease);

        if swapped {
            info!(
                request_id = %ctx.request_id,
                user_id = %user_id,
                device_id = %device_id,
                entry_id = %entry_id,
                "Version {} -> {} committed under lock in {}ms",
                base_version,
                new_version,
                ctx.elapsed_ms()
            );
            return Ok(CommitOutcome::Committed { new_version });
        }

        warn!(
            request_id = %ctx.request_id,
            user_id = %user_id,
            "CAS failed while holding the version lock"
        );
        self.conflict_after_lost_cas(ctx, user_id, base_version, entry_id)
            .await
    }

    /// Confirmed changes after `since_version`, in ascending order.
    ///
    /// Applying `changes` in order brings a client to `current_version`.
    pub async fn pull(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        since_version: Version,
    ) -> Result<PullBatch, SyncError> {
        check_user(user_id)?;
        check_version(since_version)?;

        let confirmed = self.versions.read(user_id).await?;

        let mut changes = Vec::new();
        let mut has_more = false;
        if since_version < confirmed {
            let mut entries = self.log.range_after(user_id, since_version, confirmed);
            while let Some(entry) = entries.try_next().await? {
                if changes.len() == self.options.max_pull_batch {
                    has_more = true;
                    break;
                }
                changes.push(entry);
            }
        }

        let current_version = if has_more {
            changes
                .last()
                .map_or(since_version, |e| e.target_version)
        } else {
            confirmed
        };

        let resync_required = self.needs_resync(since_version, confirmed, &changes);
        if resync_required {
            warn!(
                request_id = %ctx.request_id,
                user_id = %user_id,
                since_version,
                confirmed,
                "Client cannot catch up incrementally"
            );
        }

        debug!(
            request_id = %ctx.request_id,
            user_id = %user_id,
            since_version,
            current_version,
            changes = changes.len(),
            has_more,
            "Pull served in {}ms",
            ctx.elapsed_ms()
        );

        Ok(PullBatch {
            current_version,
            changes,
            has_more,
            resync_required,
        })
    }

    fn needs_resync(
        &self,
        since_version: Version,
        confirmed: Version,
        changes: &[ChangeLogEntry],
    ) -> bool {
        // Client claims a version the server never confirmed
        if since_version > confirmed {
            return true;
        }
        if since_version == confirmed {
            return false;
        }
        // History right after the client's version is gone
        if changes
            .first()
            .map_or(true, |e| e.target_version != since_version + 1)
        {
            return true;
        }
        self.options
            .resync_threshold
            .map_or(false, |limit| (confirmed - since_version) as u64 > limit)
    }

    async fn conflict_after_lost_cas(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        base_version: Version,
        entry_id: EntryId,
    ) -> Result<CommitOutcome, SyncError> {
        match self.log.discard(user_id, entry_id).await {
            Ok(true) => debug!(
                request_id = %ctx.request_id,
                user_id = %user_id,
                entry_id = %entry_id,
                "Discarded entry of lost CAS"
            ),
            Ok(false) => {}
            Err(e) => warn!(
                request_id = %ctx.request_id,
                user_id = %user_id,
                entry_id = %entry_id,
                "Failed to discard entry of lost CAS, leaving it to the reconciler: {}",
                e
            ),
        }

        let current_version = self.versions.read(user_id).await?;
        info!(
            request_id = %ctx.request_id,
            user_id = %user_id,
            base_version,
            current_version,
            "Commit lost the version race"
        );
        Ok(CommitOutcome::Conflict { current_version })
    }
}

fn check_user(user_id: &str) -> Result<(), SyncError> {
    if user_id.trim().is_empty() {
        return Err(SyncError::InvalidArgument("user id is required".to_string()));
    }
    Ok(())
}

/// Validate a commit request before any mutation and serialize its payload
fn prepare(
    user_id: &str,
    device_id: &str,
    base_version: Version,
    changeset: &Changeset,
) -> Result<(Version, String), SyncError> {
    check_user(user_id)?;
    if device_id.trim().is_empty() {
        return Err(SyncError::InvalidArgument(
            "device id is required".to_string(),
        ));
    }
    check_version(base_version)?;
    let new_version = base_version.checked_add(1).ok_or_else(|| {
        SyncError::InvalidVersion(format!("version {} cannot advance", base_version))
    })?;
    changeset.validate()?;
    Ok((new_version, changeset.to_payload()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::memory::MemoryStore;
    use crate::sync::types::{EntryFilter, EntryStatus, INITIAL_VERSION};
    use crate::sync::version_store::UserLocks;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryStore>, SyncCoordinator) {
        let store = Arc::new(MemoryStore::default());
        let coordinator = SyncCoordinator::from_store(store.clone(), CoordinatorOptions::default());
        (store, coordinator)
    }

    fn change(val: i64) -> Changeset {
        Changeset(json!({"field": "x", "val": val}))
    }

    async fn advance_to(coordinator: &SyncCoordinator, user: &str, target: Version) {
        let ctx = RequestContext::new();
        for base in INITIAL_VERSION..target {
            let outcome = coordinator
                .commit(&ctx, user, "seed", base, &change(base))
                .await
                .unwrap();
            assert!(outcome.is_committed());
        }
    }

    #[tokio::test]
    async fn test_first_commit_creates_version_row() {
        let (store, coordinator) = setup();
        let ctx = RequestContext::new();

        let outcome = coordinator
            .commit(&ctx, "user-1", "phone", INITIAL_VERSION, &change(1))
            .await
            .unwrap();

        assert_eq!(outcome, CommitOutcome::Committed { new_version: 1 });
        assert_eq!(store.user_count(), 1);
        assert_eq!(coordinator.current_version("user-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_base_version_rejected_before_mutation() {
        let (store, coordinator) = setup();
        let ctx = RequestContext::new();

        let err = coordinator
            .commit(&ctx, "user-1", "phone", -1, &change(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidVersion(_)));

        let err = coordinator
            .commit(&ctx, "user-1", "phone", Version::MAX, &change(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidVersion(_)));

        assert_eq!(store.user_count(), 0);
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_changeset_rejected_before_mutation() {
        let (store, coordinator) = setup();
        let ctx = RequestContext::new();

        let err = coordinator
            .commit(&ctx, "user-1", "phone", 0, &Changeset(serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidChangeset(_)));

        let err = coordinator
            .commit(&ctx, "", "phone", 0, &change(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));

        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_base_conflicts_without_append() {
        let (store, coordinator) = setup();
        advance_to(&coordinator, "user-1", 3).await;
        let entries_before = store.entry_count();

        let outcome = coordinator
            .commit(&RequestContext::new(), "user-1", "tablet", 1, &change(9))
            .await
            .unwrap();

        assert_eq!(outcome, CommitOutcome::Conflict { current_version: 3 });
        assert_eq!(store.entry_count(), entries_before);
    }

    #[tokio::test]
    async fn test_two_device_scenario() {
        let (store, coordinator) = setup();
        advance_to(&coordinator, "user-1", 5).await;
        let ctx = RequestContext::new();

        let a = coordinator
            .commit(&ctx, "user-1", "device-a", 5, &change(1))
            .await
            .unwrap();
        assert_eq!(a, CommitOutcome::Committed { new_version: 6 });

        let b = coordinator
            .commit(&ctx, "user-1", "device-b", 5, &change(2))
            .await
            .unwrap();
        assert_eq!(b, CommitOutcome::Conflict { current_version: 6 });

        let batch = coordinator.pull(&ctx, "user-1", 5).await.unwrap();
        assert_eq!(batch.current_version, 6);
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(batch.changes[0].target_version, 6);
        assert_eq!(batch.changes[0].device_id, "device-a");
        assert!(!batch.has_more);
        assert!(!batch.resync_required);

        let retry = coordinator
            .commit(&ctx, "user-1", "device-b", batch.current_version, &change(2))
            .await
            .unwrap();
        assert_eq!(retry, CommitOutcome::Committed { new_version: 7 });

        // No unconfirmed leftovers
        let leftovers = store
            .find(&EntryFilter::for_user("user-1").with_status(EntryStatus::Orphaned))
            .await
            .unwrap();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_lost_cas_discards_own_entry() {
        let store = Arc::new(MemoryStore::default());
        let coordinator =
            SyncCoordinator::from_store(store.clone(), CoordinatorOptions::default());
        let ctx = RequestContext::new();

        // Loser appended, then a rival won the version before its CAS
        store.ensure_exists("user-1").await.unwrap();
        let loser = store.append("user-1", 1, "{}", "loser").await.unwrap();
        advance_to(&coordinator, "user-1", 1).await;

        let outcome = coordinator
            .conflict_after_lost_cas(&ctx, "user-1", 0, loser)
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Conflict { current_version: 1 });
        assert_eq!(store.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_confirmed_versions_are_contiguous() {
        let (store, coordinator) = setup();
        advance_to(&coordinator, "user-1", 10).await;

        let confirmed = store
            .find(&EntryFilter::for_user("user-1").with_status(EntryStatus::Confirmed))
            .await
            .unwrap();
        let versions: Vec<Version> = confirmed.iter().map(|e| e.entry.target_version).collect();
        assert_eq!(versions, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_pull_is_repeatable_and_prefix_stable() {
        let (_store, coordinator) = setup();
        advance_to(&coordinator, "user-1", 3).await;
        let ctx = RequestContext::new();

        let first = coordinator.pull(&ctx, "user-1", 1).await.unwrap();
        let second = coordinator.pull(&ctx, "user-1", 1).await.unwrap();
        assert_eq!(first, second);

        coordinator
            .commit(&ctx, "user-1", "phone", 3, &change(4))
            .await
            .unwrap();
        let third = coordinator.pull(&ctx, "user-1", 1).await.unwrap();
        assert_eq!(third.current_version, 4);
        assert_eq!(&third.changes[..first.changes.len()], &first.changes[..]);
        assert_eq!(third.changes.len(), 3);
    }

    #[tokio::test]
    async fn test_pull_replays_to_current_state() {
        let (_store, coordinator) = setup();
        let ctx = RequestContext::new();
        for (base, val) in [(0, 10), (1, 20), (2, 30)] {
            coordinator
                .commit(&ctx, "user-1", "phone", base, &change(val))
                .await
                .unwrap();
        }

        let batch = coordinator.pull(&ctx, "user-1", 0).await.unwrap();
        let replayed = batch
            .changes
            .iter()
            .map(|e| serde_json::from_str::<serde_json::Value>(&e.payload).unwrap())
            .fold(None, |_, payload| Some(payload["val"].as_i64().unwrap()));
        assert_eq!(batch.current_version, 3);
        assert_eq!(replayed, Some(30));
    }

    #[tokio::test]
    async fn test_pull_truncates_to_batch_limit() {
        let store = Arc::new(MemoryStore::default());
        let coordinator = SyncCoordinator::from_store(
            store,
            CoordinatorOptions {
                max_pull_batch: 2,
                resync_threshold: None,
            },
        );
        advance_to(&coordinator, "user-1", 5).await;
        let ctx = RequestContext::new();

        let page = coordinator.pull(&ctx, "user-1", 0).await.unwrap();
        assert!(page.has_more);
        assert_eq!(page.current_version, 2);
        assert_eq!(page.changes.len(), 2);

        let page = coordinator.pull(&ctx, "user-1", 2).await.unwrap();
        assert!(page.has_more);
        assert_eq!(page.current_version, 4);

        let page = coordinator.pull(&ctx, "user-1", 4).await.unwrap();
        assert!(!page.has_more);
        assert_eq!(page.current_version, 5);
        assert_eq!(page.changes.len(), 1);
    }

    #[tokio::test]
    async fn test_pull_flags_resync() {
        let store = Arc::new(MemoryStore::default());
        let coordinator = SyncCoordinator::from_store(
            store,
            CoordinatorOptions {
                max_pull_batch: 100,
                resync_threshold: Some(3),
            },
        );
        advance_to(&coordinator, "user-1", 5).await;
        let ctx = RequestContext::new();

        assert!(coordinator.pull(&ctx, "user-1", 9).await.unwrap().resync_required);
        assert!(coordinator.pull(&ctx, "user-1", 0).await.unwrap().resync_required);
        assert!(!coordinator.pull(&ctx, "user-1", 2).await.unwrap().resync_required);
        assert!(!coordinator.pull(&ctx, "user-1", 5).await.unwrap().resync_required);
    }

    #[tokio::test]
    async fn test_pull_rejects_negative_version() {
        let (_store, coordinator) = setup();
        let err = coordinator
            .pull(&RequestContext::new(), "user-1", -3)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidVersion(_)));
    }

    #[tokio::test]
    async fn test_pull_unknown_user() {
        let (_store, coordinator) = setup();
        let batch = coordinator
            .pull(&RequestContext::new(), "ghost", 0)
            .await
            .unwrap();
        assert_eq!(batch.current_version, INITIAL_VERSION);
        assert!(batch.changes.is_empty());
        assert!(!batch.resync_required);
    }

    #[tokio::test]
    async fn test_exclusive_commit() {
        let (_store, coordinator) = setup();
        let ctx = RequestContext::new();

        let outcome = coordinator
            .commit_exclusive(&ctx, "user-1", "phone", 0, &change(1))
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { new_version: 1 });

        let stale = coordinator
            .commit_exclusive(&ctx, "user-1", "tablet", 0, &change(2))
            .await
            .unwrap();
        assert_eq!(stale, CommitOutcome::Conflict { current_version: 1 });
    }

    #[tokio::test]
    async fn test_exclusive_commit_times_out_on_held_lock() {
        let store = Arc::new(MemoryStore::new(UserLocks::new(Duration::from_millis(30))));
        let coordinator =
            SyncCoordinator::from_store(store.clone(), CoordinatorOptions::default());
        let ctx = RequestContext::new();

        let lease = store.read_for_update("user-1").await.unwrap();
        let err = coordinator
            .commit_exclusive(&ctx, "user-1", "phone", 0, &change(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::LockTimeout { .. }));
        assert!(err.is_retryable());
        drop(lease);

        let outcome = coordinator
            .commit_exclusive(&ctx, "user-1", "phone", 0, &change(1))
            .await
            .unwrap();
        assert!(outcome.is_committed());
    }

    #[tokio::test]
    async fn test_cas_path_does_not_wait_for_lock() {
        let store = Arc::new(MemoryStore::new(UserLocks::new(Duration::from_millis(30))));
        let coordinator =
            SyncCoordinator::from_store(store.clone(), CoordinatorOptions::default());

        let _lease = store.read_for_update("user-1").await.unwrap();
        let outcome = coordinator
            .commit(&RequestContext::new(), "user-1", "phone", 0, &change(1))
            .await
            .unwrap();
        assert!(outcome.is_committed());
    }
}
