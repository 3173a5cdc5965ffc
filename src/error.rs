use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use utoipa::ToSchema;

use crate::auth::AuthFailure;
use crate::quota::QuotaReason;

/// Failures raised by a single browser session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("browser session crashed: {0}")]
    Crashed(String),

    #[error("script evaluation failed: {0}")]
    Script(String),
}

impl BrowserError {
    /// Worth another attempt on the same session (network hiccup, slow first paint).
    pub fn is_transient(&self) -> bool {
        matches!(self, BrowserError::Navigation(_) | BrowserError::Timeout(_))
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, BrowserError::Crashed(_))
    }
}

/// Everything a scrape request can fail with, as seen by the HTTP caller.
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("unauthorized: {0}")]
    Unauthorized(AuthFailure),

    #[error("quota exceeded ({reason}), retry in {}s", .retry_after.as_secs())]
    Quota {
        reason: QuotaReason,
        retry_after: Duration,
    },

    #[error("no browser session became available")]
    PoolExhausted { retry_after: Duration },

    #[error("failed to start a browser session: {0}")]
    SpawnFailed(String),

    /// `retries_exhausted` marks a transient failure that outlasted every
    /// retry; the upstream is then treated as timing out rather than broken.
    #[error("navigation to {url} failed: {message}")]
    Navigation {
        url: String,
        message: String,
        retries_exhausted: bool,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("required fields missing: {}", field_list(.fields_missing))]
    Extraction { fields_missing: BTreeSet<String> },

    #[error("channel {0} not found or unavailable")]
    ChannelNotFound(String),

    #[error("browser session crashed: {0}")]
    SessionCrashed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn field_list(fields: &BTreeSet<String>) -> String {
    fields.iter().cloned().collect::<Vec<_>>().join(", ")
}

impl ScrapeError {
    pub fn missing_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScrapeError::Extraction {
            fields_missing: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ScrapeError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ScrapeError::Quota { .. } => StatusCode::TOO_MANY_REQUESTS,
            ScrapeError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ScrapeError::InvalidRequest(_)
            | ScrapeError::ChannelNotFound(_)
            | ScrapeError::Extraction { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ScrapeError::Navigation {
                retries_exhausted: true,
                ..
            }
            | ScrapeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ScrapeError::Navigation { .. }
            | ScrapeError::SessionCrashed(_)
            | ScrapeError::SpawnFailed(_) => StatusCode::BAD_GATEWAY,
            ScrapeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for the `reason` field.
    pub fn reason(&self) -> &'static str {
        match self {
            ScrapeError::Unauthorized(failure) => failure.code(),
            ScrapeError::Quota { reason, .. } => reason.code(),
            ScrapeError::PoolExhausted { .. } => "pool_exhausted",
            ScrapeError::SpawnFailed(_) => "spawn_failed",
            ScrapeError::Navigation { .. } => "navigation_failed",
            ScrapeError::Timeout(_) => "timeout",
            ScrapeError::Extraction { .. } => "fields_missing",
            ScrapeError::ChannelNotFound(_) => "channel_not_found",
            ScrapeError::SessionCrashed(_) => "session_crashed",
            ScrapeError::InvalidRequest(_) => "invalid_request",
            ScrapeError::Internal(_) => "internal",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ScrapeError::Quota { retry_after, .. } | ScrapeError::PoolExhausted { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Whether the session that produced this error must be disposed rather than
    /// returned to the idle set. Only failures that happened on a fully loaded page
    /// leave the browser in a known-good state.
    pub fn poisons_session(&self) -> bool {
        !matches!(
            self,
            ScrapeError::Extraction { .. }
                | ScrapeError::ChannelNotFound(_)
                | ScrapeError::InvalidRequest(_)
        )
    }
}

/// Body of every non-200 response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields_missing: Option<Vec<String>>,
}

impl IntoResponse for ScrapeError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Round up so callers never retry a fraction of a second too early
        let retry_secs = self
            .retry_after()
            .map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0));
        let fields_missing = match &self {
            ScrapeError::Extraction { fields_missing } => {
                Some(fields_missing.iter().cloned().collect())
            }
            _ => None,
        };

        if status.is_server_error() {
            tracing::error!(reason = self.reason(), "request failed: {}", self);
        } else {
            tracing::warn!(reason = self.reason(), "request rejected: {}", self);
        }

        let body = ErrorBody {
            error: self.to_string(),
            reason: self.reason().to_string(),
            retry_after: retry_secs,
            fields_missing,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
