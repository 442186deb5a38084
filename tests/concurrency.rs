use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tempfile::TempDir;

use learning_sync_server::config::DatabaseConfig;
use learning_sync_server::context::RequestContext;
use learning_sync_server::db::{create_pool, SqliteStore};
use learning_sync_server::sync::{
    ChangeLog, Changeset, CommitOutcome, CoordinatorOptions, EntryFilter, EntryStatus,
    MemoryStore, Reconciler, SyncCoordinator, UserLocks, Version, VersionStore,
};

const MAX_ATTEMPTS: usize = 1000;

async fn sqlite_store() -> (Arc<SqliteStore>, TempDir) {
    let tmp_dir = TempDir::new().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", tmp_dir.path().join("sync.db").display());
    let pool = create_pool(&DatabaseConfig {
        url,
        max_connections: 8,
    })
    .await
    .expect("Failed to create pool");
    (
        Arc::new(SqliteStore::new(pool, UserLocks::new(Duration::from_secs(30)))),
        tmp_dir,
    )
}

fn change(device: &str, val: usize) -> Changeset {
    Changeset(json!({"device": device, "val": val}))
}

/// Client retry loop: on conflict, rebase on the reported version and retry
async fn commit_with_retry(
    coordinator: &SyncCoordinator,
    user: &str,
    device: &str,
    val: usize,
    exclusive: bool,
) -> Version {
    let ctx = RequestContext::new().with_device(device);
    let mut base = coordinator.current_version(user).await.unwrap();
    for _ in 0..MAX_ATTEMPTS {
        let changeset = change(device, val);
        let outcome = if exclusive {
            coordinator
                .commit_exclusive(&ctx, user, device, base, &changeset)
                .await
                .unwrap()
        } else {
            coordinator
                .commit(&ctx, user, device, base, &changeset)
                .await
                .unwrap()
        };
        match outcome {
            CommitOutcome::Committed { new_version } => return new_version,
            CommitOutcome::Conflict { current_version } => {
                base = current_version;
                tokio::task::yield_now().await;
            }
        }
    }
    panic!("{} could not commit after {} attempts", device, MAX_ATTEMPTS);
}

async fn assert_contiguous_history<S>(store: &S, coordinator: &SyncCoordinator, user: &str, expected: Version)
where
    S: VersionStore + ChangeLog,
{
    assert_eq!(store.read(user).await.unwrap(), expected);

    let confirmed = store
        .find(&EntryFilter::for_user(user).with_status(EntryStatus::Confirmed))
        .await
        .unwrap();
    let versions: Vec<Version> = confirmed.iter().map(|e| e.entry.target_version).collect();
    assert_eq!(versions, (1..=expected).collect::<Vec<_>>());

    let batch = coordinator
        .pull(&RequestContext::new(), user, 0)
        .await
        .unwrap();
    assert_eq!(batch.current_version, expected);
    assert_eq!(batch.changes.len() as i64, expected);
    assert!(!batch.resync_required);
}

async fn single_winner<S>(store: Arc<S>)
where
    S: VersionStore + ChangeLog + 'static,
{
    let coordinator = SyncCoordinator::from_store(store.clone(), CoordinatorOptions::default());
    let writers = 16;

    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let device = format!("device-{}", i);
                coordinator
                    .commit(&RequestContext::new(), "user-1", &device, 0, &change(&device, i))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let outcomes: Vec<CommitOutcome> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let winners = outcomes.iter().filter(|o| o.is_committed()).count();
    assert_eq!(winners, 1);
    for outcome in &outcomes {
        if let CommitOutcome::Conflict { current_version } = outcome {
            assert_eq!(*current_version, 1);
        }
    }

    assert_contiguous_history(store.as_ref(), &coordinator, "user-1", 1).await;

    // Every loser discarded its own entry
    let leftovers = store
        .find(&EntryFilter::for_user("user-1"))
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.status != EntryStatus::Confirmed)
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_winner_memory() {
    single_winner(Arc::new(MemoryStore::default())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_winner_sqlite() {
    let (store, _tmp) = sqlite_store().await;
    single_winner(store).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_access_creates_one_row() {
    let (store, _tmp) = sqlite_store().await;

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.ensure_exists("new-user").await })
        })
        .collect();
    for result in join_all(handles).await {
        result.unwrap().unwrap();
    }

    let versions = store.list_versions().await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].user_id, "new-user");
    assert_eq!(versions[0].version, 0);
}

async fn racing_writers<S>(store: Arc<S>, exclusive: bool)
where
    S: VersionStore + ChangeLog + 'static,
{
    let coordinator = SyncCoordinator::from_store(store.clone(), CoordinatorOptions::default());
    let devices = 4;
    let commits_per_device = 10;

    let handles: Vec<_> = (0..devices)
        .map(|d| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let device = format!("device-{}", d);
                let mut produced = Vec::new();
                for val in 0..commits_per_device {
                    produced.push(
                        commit_with_retry(&coordinator, "user-1", &device, val, exclusive).await,
                    );
                }
                produced
            })
        })
        .collect();

    let mut produced: Vec<Version> = join_all(handles)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();
    produced.sort_unstable();

    let total = (devices * commits_per_device) as Version;
    assert_eq!(produced, (1..=total).collect::<Vec<_>>());
    assert_contiguous_history(store.as_ref(), &coordinator, "user-1", total).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_writers_memory() {
    racing_writers(Arc::new(MemoryStore::default()), false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_writers_sqlite() {
    let (store, _tmp) = sqlite_store().await;
    racing_writers(store, false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_exclusive_writers_sqlite() {
    let (store, _tmp) = sqlite_store().await;
    racing_writers(store, true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sweep_racing_commits_keeps_history() {
    let (store, _tmp) = sqlite_store().await;
    let coordinator = SyncCoordinator::from_store(store.clone(), CoordinatorOptions::default());
    let reconciler = Reconciler::from_store(store.clone());

    let sweeper = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                reconciler.sweep_all(&RequestContext::new()).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let writers: Vec<_> = (0..3)
        .map(|d| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let device = format!("device-{}", d);
                for val in 0..10 {
                    commit_with_retry(&coordinator, "user-1", &device, val, false).await;
                }
            })
        })
        .collect();

    for result in join_all(writers).await {
        result.unwrap();
    }
    sweeper.await.unwrap();

    assert_contiguous_history(store.as_ref(), &coordinator, "user-1", 30).await;

    let report = reconciler.check_consistency().await.unwrap();
    if !report.healthy {
        reconciler.sweep_all(&RequestContext::new()).await.unwrap();
        assert!(reconciler.check_consistency().await.unwrap().healthy);
    }
}

#[tokio::test]
async fn test_lock_timeout_is_bounded() {
    let store = Arc::new(MemoryStore::new(UserLocks::new(Duration::from_millis(50))));
    let coordinator = SyncCoordinator::from_store(store.clone(), CoordinatorOptions::default());

    let lease = store.read_for_update("user-1").await.unwrap();
    let started = std::time::Instant::now();
    let err = coordinator
        .commit_exclusive(&RequestContext::new(), "user-1", "phone", 0, &change("phone", 1))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(started.elapsed() < Duration::from_secs(2));
    drop(lease);

    // Other users are unaffected by the held lock
    let lease = store.read_for_update("user-1").await.unwrap();
    let outcome = coordinator
        .commit_exclusive(&RequestContext::new(), "user-2", "phone", 0, &change("phone", 1))
        .await
        .unwrap();
    assert!(outcome.is_committed());
    drop(lease);
}
