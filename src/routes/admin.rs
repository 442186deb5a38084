//! Administrative endpoints
//!
//! Reconciliation, version listings and change log inspection.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::context::RequestContext;
use crate::error::Result;
use crate::state::AppState;
use crate::sync::{
    ConsistencyReport, EntryFilter, EntryStatus, InspectedEntry, ReconcileSummary,
    ReconcilerStats, UserVersion, Version,
};

/// Create the admin router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/reconcile", post(reconcile))
        .route("/versions", get(list_versions))
        .route("/consistency", get(consistency))
        .route("/stats", get(stats))
        .route("/entries", get(list_entries))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileRequest {
    /// Sweep only this user; all users when absent
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EntriesQuery {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
    #[serde(rename = "minVersion")]
    pub min_version: Option<Version>,
    #[serde(rename = "maxVersion")]
    pub max_version: Option<Version>,
    pub status: Option<String>,
    pub limit: Option<u32>,
}

impl EntriesQuery {
    fn into_filter(self) -> Result<EntryFilter> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<EntryStatus>)
            .transpose()?;

        Ok(EntryFilter {
            user_id: self.user_id,
            device_id: self.device_id,
            min_version: self.min_version,
            max_version: self.max_version,
            status,
            limit: self.limit,
        })
    }
}

/// Run an on-demand sweep
async fn reconcile(
    State(state): State<AppState>,
    ctx: RequestContext,
    body: Option<Json<ReconcileRequest>>,
) -> Result<Json<ReconcileSummary>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let reconciler = state.reconciler();

    let summary = match req.user_id {
        Some(user_id) => ReconcileSummary::from(reconciler.sweep(&ctx, &user_id).await?),
        None => reconciler.sweep_all(&ctx).await?,
    };
    Ok(Json(summary))
}

/// All users with their versions, highest first
async fn list_versions(State(state): State<AppState>) -> Result<Json<Vec<UserVersion>>> {
    Ok(Json(state.reconciler().audit_snapshot().await?))
}

async fn consistency(State(state): State<AppState>) -> Result<Json<ConsistencyReport>> {
    Ok(Json(state.reconciler().check_consistency().await?))
}

async fn stats(State(state): State<AppState>) -> Json<ReconcilerStats> {
    Json(state.reconciler().stats())
}

/// Inspect change log entries with their derived status
async fn list_entries(
    State(state): State<AppState>,
    Query(query): Query<EntriesQuery>,
) -> Result<Json<Vec<InspectedEntry>>> {
    let filter = query.into_filter()?;
    let entries = state.reconciler().inspect(&filter).await?;
    Ok(Json(entries))
}
