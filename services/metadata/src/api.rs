use crate::config::ApiConfig;
use crate::video_store::{MalformedId, PageRequest, StoreError, VideoId, VideoMetadata, VideoStore};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn VideoStore>,
}

/// Query parameters for `GET /video`
#[derive(Debug, Deserialize)]
pub struct VideoLookup {
    pub id: Option<String>,
}

/// `GET /videos` body
#[derive(Debug, Serialize, Deserialize)]
pub struct VideoListResponse {
    pub videos: Vec<VideoMetadata>,
}

/// `GET /video` body
#[derive(Debug, Serialize, Deserialize)]
pub struct VideoResponse {
    pub video: VideoMetadata,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Failures as seen by HTTP callers. This is the only place internal errors
/// are turned into status codes; details go to the log, never the body.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid video id: {0}")]
    InvalidId(#[from] MalformedId),

    #[error("Missing required query parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Video not found")]
    NotFound,

    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidId(_) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "Invalid video id".to_string(),
                    code: "INVALID_ID".to_string(),
                }),
            )
                .into_response(),
            ApiError::MissingParameter(name) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("Missing query parameter '{name}'"),
                    code: "MISSING_PARAMETER".to_string(),
                }),
            )
                .into_response(),
            ApiError::NotFound => StatusCode::NOT_FOUND.into_response(),
            ApiError::Storage(e) => {
                error!(error = %e, "Storage failure while serving request");
                metrics::counter!("metadata.http.storage_errors").increment(1);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: "Internal server error".to_string(),
                        code: "INTERNAL_ERROR".to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/videos", get(list_videos))
        .route("/video", get(get_video))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "metadata-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => {
            error!(error = %e, "Readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "not_ready",
                    "database": "disconnected"
                })),
            )
        }
    }
}

/// Every stored video, unpaginated
#[instrument(skip(state))]
async fn list_videos(State(state): State<AppState>) -> Result<Json<VideoListResponse>, ApiError> {
    let videos = state.store.list_videos(&PageRequest::all()).await?;
    Ok(Json(VideoListResponse { videos }))
}

/// One video by id
#[instrument(skip(state))]
async fn get_video(
    State(state): State<AppState>,
    Query(params): Query<VideoLookup>,
) -> Result<Json<VideoResponse>, ApiError> {
    let raw_id = params.id.ok_or(ApiError::MissingParameter("id"))?;
    let id = VideoId::parse(&raw_id)?;

    match state.store.get_video(&id).await? {
        Some(video) => Ok(Json(VideoResponse { video })),
        None => Err(ApiError::NotFound),
    }
}

/// Bind the HTTP listener
pub async fn bind_listener(config: &ApiConfig) -> std::io::Result<TcpListener> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "HTTP listener bound");

    Ok(listener)
}

/// Serve `router` until `shutdown` resolves, then drain in-flight requests
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
