//! Per-request context
//!
//! Carries request timing and correlation data explicitly through the call
//! chain instead of keeping it in ambient per-thread state.

use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Header used to propagate a caller-supplied request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Header naming the calling device
pub const DEVICE_ID_HEADER: &str = "x-device-id";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub started_at: Instant,
    pub received_at: DateTime<Utc>,
    pub device_id: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            started_at: Instant::now(),
            received_at: Utc::now(),
            device_id: None,
        }
    }

    pub fn with_device(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let mut ctx = RequestContext::new();
        if let Some(id) = header(REQUEST_ID_HEADER).and_then(|v| Uuid::parse_str(&v).ok()) {
            ctx.request_id = id;
        }
        ctx.device_id = header(DEVICE_ID_HEADER);
        Ok(ctx)
    }
}
