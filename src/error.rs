//! Error types for the learning sync server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::sync::SyncError;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Sync(e) => match e {
                SyncError::InvalidVersion(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_version", e.to_string())
                }
                SyncError::InvalidChangeset(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_changeset", e.to_string())
                }
                SyncError::InvalidArgument(_) => {
                    (StatusCode::BAD_REQUEST, "bad_request", e.to_string())
                }
                SyncError::VersionConflict { .. } => {
                    (StatusCode::CONFLICT, "version_conflict", e.to_string())
                }
                SyncError::LockTimeout { .. } => {
                    tracing::warn!("{}", e);
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "lock_timeout",
                        "Version is busy, retry later".to_string(),
                    )
                }
                SyncError::Persistence(err) => {
                    tracing::error!("Persistence failure: {}", err);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "database_error",
                        "Database error".to_string(),
                    )
                }
                SyncError::Serialization(_) | SyncError::CorruptRecord(_) => {
                    tracing::error!("Stored data error: {}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "data_error",
                        "Stored sync data could not be read".to_string(),
                    )
                }
            },
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    "Database error".to_string(),
                )
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = self.parts();

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            details: if cfg!(debug_assertions) {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}
