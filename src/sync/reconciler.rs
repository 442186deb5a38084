//! Orphan reconciliation
//!
//! Reclaims change log entries whose commit never happened: orphans tagged
//! above the confirmed version (lost CAS races, crashed writers) and
//! superseded entries whose version slot was taken by another commit.
//! Safe to run concurrently with live traffic and with itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::context::RequestContext;

use super::change_log::ChangeLog;
use super::error::SyncError;
use super::types::{EntryFilter, InspectedEntry, UserVersion, Version};
use super::version_store::VersionStore;

/// Outcome of sweeping one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "confirmedVersion")]
    pub confirmed_version: Version,
    #[serde(rename = "orphansDeleted")]
    pub orphans_deleted: u64,
    #[serde(rename = "supersededDeleted")]
    pub superseded_deleted: u64,
}

impl SweepReport {
    pub fn entries_deleted(&self) -> u64 {
        self.orphans_deleted + self.superseded_deleted
    }
}

/// Outcome of a sweep over several users
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    #[serde(rename = "usersSwept")]
    pub users_swept: u64,
    #[serde(rename = "entriesDeleted")]
    pub entries_deleted: u64,
}

impl From<SweepReport> for ReconcileSummary {
    fn from(report: SweepReport) -> Self {
        Self {
            users_swept: 1,
            entries_deleted: report.entries_deleted(),
        }
    }
}

/// A user whose log holds unconfirmed entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyIssue {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "confirmedVersion")]
    pub confirmed_version: Version,
    #[serde(rename = "orphanCount")]
    pub orphan_count: u64,
    #[serde(rename = "supersededCount")]
    pub superseded_count: u64,
}

/// Read-only health check of every known user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub healthy: bool,
    pub issues: Vec<ConsistencyIssue>,
}

/// Snapshot of the reconciler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilerStats {
    pub sweeps: u64,
    #[serde(rename = "orphansDetected")]
    pub orphans_detected: u64,
    #[serde(rename = "entriesDeleted")]
    pub entries_deleted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sweeps: AtomicU64,
    orphans_detected: AtomicU64,
    entries_deleted: AtomicU64,
}

/// Background and on-demand cleanup of unconfirmed change log entries
#[derive(Clone)]
pub struct Reconciler {
    versions: Arc<dyn VersionStore>,
    log: Arc<dyn ChangeLog>,
    counters: Arc<Counters>,
}

impl Reconciler {
    pub fn new(versions: Arc<dyn VersionStore>, log: Arc<dyn ChangeLog>) -> Self {
        Self {
            versions,
            log,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Build over one backend implementing both traits
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: VersionStore + ChangeLog + 'static,
    {
        Self::new(store.clone(), store)
    }

    pub fn stats(&self) -> ReconcilerStats {
        ReconcilerStats {
            sweeps: self.counters.sweeps.load(Ordering::Relaxed),
            orphans_detected: self.counters.orphans_detected.load(Ordering::Relaxed),
            entries_deleted: self.counters.entries_deleted.load(Ordering::Relaxed),
        }
    }

    /// Delete the user's orphaned and superseded entries.
    ///
    /// A user seen for the first time gets a version row. An in-flight commit
    /// whose pending entry is removed here fails its CAS and reports a conflict.
    pub async fn sweep(
        &self,
        ctx: &RequestContext,
        user_id: &str,
    ) -> Result<SweepReport, SyncError> {
        self.versions.ensure_exists(user_id).await?;
        let confirmed = self.versions.read(user_id).await?;

        let orphan_count = self.log.count_above(user_id, confirmed).await?;
        let orphans_deleted = if orphan_count > 0 {
            self.counters
                .orphans_detected
                .fetch_add(orphan_count, Ordering::Relaxed);
            warn!(
                request_id = %ctx.request_id,
                user_id = %user_id,
                confirmed_version = confirmed,
                orphan_count,
                "Orphaned change log entries detected"
            );
            self.log.delete_above(user_id, confirmed).await?
        } else {
            0
        };

        let superseded_count = self.log.count_superseded(user_id, confirmed).await?;
        let superseded_deleted = if superseded_count > 0 {
            self.log.delete_superseded(user_id, confirmed).await?
        } else {
            0
        };

        let report = SweepReport {
            user_id: user_id.to_string(),
            confirmed_version: confirmed,
            orphans_deleted,
            superseded_deleted,
        };

        self.counters.sweeps.fetch_add(1, Ordering::Relaxed);
        self.counters
            .entries_deleted
            .fetch_add(report.entries_deleted(), Ordering::Relaxed);

        if report.entries_deleted() > 0 {
            info!(
                request_id = %ctx.request_id,
                user_id = %user_id,
                orphans_deleted,
                superseded_deleted,
                "Sweep reclaimed entries in {}ms",
                ctx.elapsed_ms()
            );
        } else {
            debug!(request_id = %ctx.request_id, user_id = %user_id, "Sweep found nothing");
        }

        Ok(report)
    }

    /// Sweep every known user. A failing user is logged and skipped.
    pub async fn sweep_all(&self, ctx: &RequestContext) -> Result<ReconcileSummary, SyncError> {
        let users = self.versions.list_versions().await?;
        let mut summary = ReconcileSummary::default();

        for user in &users {
            match self.sweep(ctx, &user.user_id).await {
                Ok(report) => {
                    summary.users_swept += 1;
                    summary.entries_deleted += report.entries_deleted();
                }
                Err(e) => error!(
                    request_id = %ctx.request_id,
                    user_id = %user.user_id,
                    "Sweep failed: {}",
                    e
                ),
            }
        }

        info!(
            request_id = %ctx.request_id,
            users = users.len(),
            users_swept = summary.users_swept,
            entries_deleted = summary.entries_deleted,
            "Reconciliation pass finished in {}ms",
            ctx.elapsed_ms()
        );
        Ok(summary)
    }

    /// Every known user and version, highest version first
    pub async fn audit_snapshot(&self) -> Result<Vec<UserVersion>, SyncError> {
        self.versions.list_versions().await
    }

    /// Report users holding unconfirmed entries without deleting anything
    pub async fn check_consistency(&self) -> Result<ConsistencyReport, SyncError> {
        let mut issues = Vec::new();
        for user in self.versions.list_versions().await? {
            let orphan_count = self.log.count_above(&user.user_id, user.version).await?;
            let superseded_count = self
                .log
                .count_superseded(&user.user_id, user.version)
                .await?;
            if orphan_count > 0 || superseded_count > 0 {
                issues.push(ConsistencyIssue {
                    user_id: user.user_id,
                    confirmed_version: user.version,
                    orphan_count,
                    superseded_count,
                });
            }
        }

        Ok(ConsistencyReport {
            healthy: issues.is_empty(),
            issues,
        })
    }

    /// Change log entries matching `filter`, with their derived status
    pub async fn inspect(&self, filter: &EntryFilter) -> Result<Vec<InspectedEntry>, SyncError> {
        self.log.find(filter).await
    }

    /// Run [`Reconciler::sweep_all`] every `period` until `shutdown` turns true
    /// or its sender is dropped. The first pass runs immediately.
    pub fn spawn_periodic(
        self,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Reconciler started, sweeping every {:?}", period);

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        let ctx = RequestContext::new();
                        if let Err(e) = self.sweep_all(&ctx).await {
                            error!(request_id = %ctx.request_id, "Reconciliation pass failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            info!("Reconciler stopped");
        })
    }
}
