// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! HTTP API — thin axum adapter in front of the [`StreamManager`]. No
//! business logic lives in handlers; they resolve path/query parameters and
//! call straight into the core, matching the teacher's `api.rs`/`manager.rs`
//! separation.
//!
//! Endpoints:
//!   GET    /stream/{channel_id}/master.m3u8    → Ensure + master playlist
//!   GET    /stream/{channel_id}/playlist.m3u8  → static read of the media playlist
//!   GET    /stream/{channel_id}/{segment_file} → static read of a `.ts` segment
//!   DELETE /stream/{channel_id}/client         → UnregisterClient
//!   POST   /stream/{channel_id}/position       → ReportPosition
//!   GET    /stream/{channel_id}/debug          → controller state snapshot

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::config::Config;
use crate::manager::StreamManager;

/// Shared state passed to all handlers.
pub struct AppState {
    pub manager: Arc<StreamManager>,
    pub config: Arc<parking_lot::RwLock<Config>>,
}

#[derive(Deserialize)]
pub struct MasterParams {
    session_id: String,
}

#[derive(Deserialize)]
pub struct ClientParams {
    session_id: String,
}

#[derive(Deserialize)]
pub struct PositionBody {
    session_id: String,
    segment_number: u64,
    #[serde(default)]
    quality: Option<String>,
    #[serde(default)]
    timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/stream/{channel_id}/master.m3u8", get(handle_master))
        .route("/stream/{channel_id}/playlist.m3u8", get(handle_playlist))
        .route("/stream/{channel_id}/debug", get(handle_debug))
        .route("/stream/{channel_id}/client", delete(handle_unregister))
        .route("/stream/{channel_id}/position", post(handle_position))
        .route("/stream/{channel_id}/{segment_file}", get(handle_segment))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(state: Arc<AppState>, port: u16) {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{port}");
    tracing::info!(port, "HTTP API listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "Failed to bind HTTP server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "HTTP server error");
    }
}

async fn handle_master(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
    Query(params): Query<MasterParams>,
) -> impl IntoResponse {
    match state.manager.ensure(&channel_id, &params.session_id).await {
        Ok(_path) => {
            let body = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-STREAM-INF:BANDWIDTH=2000000\nplaylist.m3u8\n";
            (
                StatusCode::OK,
                [("content-type", "application/vnd.apple.mpegurl")],
                body,
            )
                .into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn handle_playlist(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> impl IntoResponse {
    let Some(controller) = state.manager.controller(&channel_id) else {
        return (StatusCode::NOT_FOUND, "channel not active").into_response();
    };
    match tokio::fs::read_to_string(controller.media_playlist_path()).await {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "application/vnd.apple.mpegurl")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

async fn handle_segment(
    State(state): State<Arc<AppState>>,
    Path((channel_id, segment_file)): Path<(String, String)>,
) -> impl IntoResponse {
    let Some(controller) = state.manager.controller(&channel_id) else {
        return (StatusCode::NOT_FOUND, "channel not active").into_response();
    };
    // Reject anything that could escape the channel's segment directory.
    if segment_file.contains('/') || segment_file.contains("..") {
        return (StatusCode::BAD_REQUEST, "invalid segment filename").into_response();
    }
    let path = controller.segment_dir().join(&segment_file);
    match tokio::fs::read(&path).await {
        Ok(data) => (StatusCode::OK, [("content-type", "video/mp2t")], data).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

async fn handle_unregister(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
    Query(params): Query<ClientParams>,
) -> impl IntoResponse {
    state.manager.unregister_client(&channel_id, &params.session_id);
    StatusCode::NO_CONTENT
}

async fn handle_position(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
    axum::Json(body): axum::Json<PositionBody>,
) -> impl IntoResponse {
    let _ = body.timestamp;
    state
        .manager
        .report_position(&channel_id, &body.session_id, body.segment_number, body.quality);
    StatusCode::NO_CONTENT
}

async fn handle_debug(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.debug_snapshot(&channel_id) {
        Ok(snapshot) => (StatusCode::OK, axum::Json(snapshot)).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}
