//! Per-user version counter
//!
//! The confirmed version of a user is the authoritative marker of that
//! user's state. It only moves forward, through a compare-and-swap or
//! under an exclusive [`VersionLease`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::error::SyncError;
use super::types::{EntryId, UserVersion, Version};

/// Default wait for an exclusive version lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable per-user version counter
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Lock registry backing [`VersionStore::read_for_update`]
    fn locks(&self) -> &UserLocks;

    /// Current confirmed version, or `INITIAL_VERSION` when the user has no row.
    /// Never blocks on writers and may be stale against an in-flight commit.
    async fn read(&self, user_id: &str) -> Result<Version, SyncError>;

    /// Atomically move `expected -> new_value`, confirming `entry_id`.
    ///
    /// Succeeds iff the stored version equals `expected` and the entry still
    /// exists for this user with `target_version == new_value`. On success the
    /// entry is recorded as the commit of `new_value` in the same step.
    async fn compare_and_swap(
        &self,
        user_id: &str,
        expected: Version,
        new_value: Version,
        entry_id: EntryId,
    ) -> Result<bool, SyncError>;

    /// Create the user's row at `INITIAL_VERSION` if absent. Idempotent and
    /// safe under concurrent first access.
    async fn ensure_exists(&self, user_id: &str) -> Result<(), SyncError>;

    /// All known users, version descending then user id ascending
    async fn list_versions(&self) -> Result<Vec<UserVersion>, SyncError>;

    /// Take the user's exclusive lock and read the version under it.
    ///
    /// The lock is held until the returned lease is dropped; waiting is
    /// bounded by the registry timeout.
    async fn read_for_update(&self, user_id: &str) -> Result<VersionLease, SyncError> {
        let guard = self.locks().acquire(user_id).await?;
        let version = self.read(user_id).await?;
        Ok(VersionLease {
            version,
            guard,
        })
    }
}

/// Exclusive hold on one user's version, the unit of work of the lock path.
///
/// A lease names exactly one user, so a unit of work never holds two user
/// locks at once.
#[derive(Debug)]
pub struct VersionLease {
    version: Version,
    guard: UserLockGuard,
}

impl VersionLease {
    pub fn user_id(&self) -> &str {
        &self.guard.user_id
    }

    /// Version read while holding the lock
    pub fn version(&self) -> Version {
        self.version
    }
}

type LockTable = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Process-wide registry of per-user exclusive locks
#[derive(Clone)]
pub struct UserLocks {
    table: Arc<LockTable>,
    timeout: Duration,
}

impl UserLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of users with a held or awaited lock
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire the lock of `user_id`, failing with `LockTimeout` after the
    /// configured wait
    pub async fn acquire(&self, user_id: &str) -> Result<UserLockGuard, SyncError> {
        let lock = self
            .table
            .lock()
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let started = Instant::now();
        match tokio::time::timeout(self.timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(UserLockGuard {
                user_id: user_id.to_string(),
                table: self.table.clone(),
                guard: Some(guard),
            }),
            Err(_) => {
                prune(&self.table, user_id);
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(user_id = %user_id, waited_ms, "Version lock wait timed out");
                Err(SyncError::LockTimeout {
                    user_id: user_id.to_string(),
                    waited_ms,
                })
            }
        }
    }
}

impl Default for UserLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl std::fmt::Debug for UserLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserLocks")
            .field("held", &self.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Held lock of one user; released on drop
pub struct UserLockGuard {
    user_id: String,
    table: Arc<LockTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for UserLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserLockGuard")
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl Drop for UserLockGuard {
    fn drop(&mut self) {
        // Release first so the table holds the only remaining reference.
        self.guard.take();
        prune(&self.table, &self.user_id);
    }
}

/// Drop the registry slot once nobody holds or awaits it
fn prune(table: &LockTable, user_id: &str) {
    let mut table = table.lock();
    if table
        .get(user_id)
        .map_or(false, |lock| Arc::strong_count(lock) == 1)
    {
        table.remove(user_id);
    }
}
