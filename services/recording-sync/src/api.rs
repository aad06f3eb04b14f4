use crate::config::ApiConfig;
use crate::correlator::EventOutcome;
use crate::index::StorageStats;
use crate::manager::RecordingManager;
use crate::recording::{is_safe_path_component, EventBuffers};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<RecordingManager>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/stats", get(get_stats))
        .route("/api/v1/events/:camera_id", post(trigger_event))
        .route(
            "/api/v1/event-buffers",
            get(get_event_buffers).put(set_event_buffers),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "recording-sync",
        "running": state.manager.is_running().await,
    }))
}

async fn get_stats(State(state): State<AppState>) -> Json<StorageStats> {
    Json(state.manager.get_stats().await)
}

/// Mark an event for a camera
#[instrument(skip(state))]
async fn trigger_event(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> Result<Json<EventOutcome>, ApiError> {
    let camera_id = camera_id.trim();
    if !is_safe_path_component(camera_id) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("Invalid camera id: {:?}", camera_id),
                code: "INVALID_CAMERA_ID".to_string(),
            }),
        ));
    }

    Ok(Json(state.manager.trigger_event(camera_id).await))
}

async fn get_event_buffers(State(state): State<AppState>) -> Json<EventBuffers> {
    Json(state.manager.event_buffers())
}

async fn set_event_buffers(
    State(state): State<AppState>,
    Json(buffers): Json<EventBuffers>,
) -> Json<EventBuffers> {
    state
        .manager
        .set_event_buffers(buffers.pre_seconds, buffers.post_seconds);
    Json(state.manager.event_buffers())
}

/// Start the control API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting control API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
