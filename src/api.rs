use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, info_span, Instrument};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::auth::AuthGate;
use crate::browser::PoolStatus;
use crate::error::{ErrorBody, ScrapeError};
use crate::models::{
    ChannelRecord, FailedVideo, ScrapeMetadata, ScrapeRequest, ScrapeRequestBody, ScrapeResult,
    Thumbnail, Thumbnails, VideoRecord,
};
use crate::scrape::Scraper;

pub const API_KEY_HEADER: &str = "x-api-key";

pub struct AppState {
    pub auth: AuthGate,
    pub scraper: Scraper,
}

#[derive(OpenApi)]
#[openapi(
    paths(scrape, health),
    components(schemas(
        ScrapeRequestBody,
        ScrapeResult,
        ChannelRecord,
        VideoRecord,
        Thumbnail,
        Thumbnails,
        ScrapeMetadata,
        FailedVideo,
        ErrorBody,
        HealthResponse,
        PoolStatus
    )),
    tags((name = "scraper", description = "Channel scraping API"))
)]
pub struct ApiDoc;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub browser: PoolStatus,
}

/// Scrape a channel's metadata and its most recent videos.
#[utoipa::path(
    post,
    path = "/scrape",
    request_body = ScrapeRequestBody,
    params(("X-API-Key" = String, Header, description = "API key")),
    responses(
        (status = 200, description = "Channel and videos", body = ScrapeResult),
        (status = 401, description = "Missing or invalid API key", body = ErrorBody),
        (
            status = 422,
            description = "Malformed request, unknown channel, or unreadable page",
            body = ErrorBody
        ),
        (status = 429, description = "Quota exhausted", body = ErrorBody),
        (status = 502, description = "Browser or navigation failure", body = ErrorBody),
        (status = 503, description = "No browser session available", body = ErrorBody),
        (status = 504, description = "Deadline hit or page kept failing to load", body = ErrorBody)
    ),
    tag = "scraper"
)]
pub async fn scrape(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<ScrapeRequestBody>, JsonRejection>,
) -> Result<Json<ScrapeResult>, ScrapeError> {
    // Authorization comes first so rejected callers never reach the browser pool
    let presented = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    let key = state.auth.authorize(presented)?;

    let Json(body) = body.map_err(|e| ScrapeError::InvalidRequest(e.body_text()))?;
    let request = ScrapeRequest::from_body(body, state.scraper.config())?;

    let span = info_span!(
        "scrape",
        request_id = %Uuid::new_v4(),
        owner = %key.owner,
        handle = %request.handle
    );
    async move {
        info!(
            max_videos = request.max_videos,
            remaining_minute = key.remaining_minute,
            remaining_day = key.remaining_day,
            "scrape accepted"
        );
        state.scraper.scrape(request).await.map(Json)
    }
    .instrument(span)
    .await
}

/// Liveness: 200 while the pool can still produce a browser session.
#[utoipa::path(
    get,
    path = "/_health",
    responses(
        (status = 200, description = "Healthy", body = HealthResponse),
        (status = 503, description = "Browser sessions cannot be spawned", body = HealthResponse)
    ),
    tag = "scraper"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let browser = state.scraper.pool().status();
    let healthy = browser.can_spawn || browser.idle > 0;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            browser,
        }),
    )
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/scrape", post(scrape))
        .route("/_health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
