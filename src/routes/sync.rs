//! Sync API endpoints
//!
//! Commit and pull for multi-device synchronization.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RequestContext;
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::sync::{ChangeLogEntry, Changeset, CommitOutcome, SyncError, UserVersion, Version};

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/commit", post(commit))
        .route("/pull", get(pull))
        .route("/version", get(current_version))
}

/// Commit request
#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Falls back to the `x-device-id` header
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
    #[serde(rename = "baseVersion")]
    pub base_version: Version,
    pub changeset: Changeset,
    /// Serialize with other exclusive writers through the user's version lock
    #[serde(default)]
    pub exclusive: bool,
}

#[derive(Debug, Deserialize)]
pub struct PullQuery {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "sinceVersion", default)]
    pub since_version: Version,
}

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    #[serde(rename = "userId")]
    pub user_id: String,
}

/// One confirmed change as sent to clients
#[derive(Debug, Serialize)]
pub struct PulledChange {
    #[serde(rename = "targetVersion")]
    pub target_version: Version,
    pub payload: Value,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ChangeLogEntry> for PulledChange {
    type Error = SyncError;

    fn try_from(entry: ChangeLogEntry) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            target_version: entry.target_version,
            payload: serde_json::from_str(&entry.payload)?,
            device_id: entry.device_id,
            created_at: entry.created_at,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct PullResponse {
    #[serde(rename = "currentVersion")]
    pub current_version: Version,
    pub changes: Vec<PulledChange>,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
    #[serde(rename = "resyncRequired")]
    pub resync_required: bool,
}

/// Commit a changeset on top of the client's base version
async fn commit(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CommitRequest>,
) -> Result<(StatusCode, Json<CommitOutcome>)> {
    let device_id = req
        .device_id
        .clone()
        .or_else(|| ctx.device_id.clone())
        .ok_or_else(|| AppError::BadRequest("deviceId is required".to_string()))?;

    let coordinator = state.coordinator();
    let outcome = if req.exclusive {
        coordinator
            .commit_exclusive(&ctx, &req.user_id, &device_id, req.base_version, &req.changeset)
            .await?
    } else {
        coordinator
            .commit(&ctx, &req.user_id, &device_id, req.base_version, &req.changeset)
            .await?
    };

    let status = if outcome.is_committed() {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(outcome)))
}

/// Pull confirmed changes after the client's version
async fn pull(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>> {
    let batch = state
        .coordinator()
        .pull(&ctx, &query.user_id, query.since_version)
        .await?;

    let changes = batch
        .changes
        .into_iter()
        .map(PulledChange::try_from)
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Json(PullResponse {
        current_version: batch.current_version,
        changes,
        has_more: batch.has_more,
        resync_required: batch.resync_required,
    }))
}

/// Current confirmed version of a user
async fn current_version(
    State(state): State<AppState>,
    Query(query): Query<VersionQuery>,
) -> Result<Json<UserVersion>> {
    let version = state.coordinator().current_version(&query.user_id).await?;
    Ok(Json(UserVersion {
        user_id: query.user_id,
        version,
    }))
}
