//! API Routes

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};
use crate::models::ApiResponse;
use crate::range_streamer;
use crate::recording_orchestrator::CameraConfig;
use crate::state::AppState;

/// Upper bound for a pushed frame
const MAX_FRAME_BODY: usize = 16 * 1024 * 1024;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Recordings
        .route("/recordings/list/:camera", get(list_recordings))
        .route("/recordings/get/:camera/:name", get(get_recording))
        .route(
            "/recordings/stream/:camera/:name",
            get(stream_recording).head(stream_recording),
        )
        .route("/recordings/thumbnail/:camera/:name", get(get_thumbnail))
        // Cameras
        .route("/api/cameras", get(list_cameras).post(create_camera))
        .route("/api/cameras/:name", get(get_camera).delete(delete_camera))
        .route("/api/cameras/:name/record", post(start_recording))
        .route("/api/cameras/:name/stop", post(stop_recording))
        .route(
            "/api/cameras/:name/frames",
            post(push_frame).layer(DefaultBodyLimit::max(MAX_FRAME_BODY)),
        )
        .fallback(super::not_found)
        .with_state(state)
}

// ========================================
// Recording Handlers
// ========================================

async fn list_recordings(
    State(state): State<AppState>,
    Path(camera): Path<String>,
) -> Result<impl IntoResponse> {
    let clips = state.catalog.list(&camera).await?;
    Ok(Json(ApiResponse::success(clips)))
}

/// Whole clip download; converts a raw clip first
async fn get_recording(
    State(state): State<AppState>,
    Path((camera, name)): Path<(String, String)>,
) -> Result<Response> {
    let path = state.catalog.get(&camera, &name).await?;
    range_streamer::serve(&path, &Method::GET, None).await
}

/// Range capable playback
async fn stream_recording(
    State(state): State<AppState>,
    Path((camera, name)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response> {
    let range = match headers.get(header::RANGE) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| Error::InvalidRange("non-ascii Range header".to_string()))?,
        ),
        None => None,
    };

    let path = state.catalog.get(&camera, &name).await?;
    range_streamer::serve(&path, &method, range).await
}

async fn get_thumbnail(
    State(state): State<AppState>,
    Path((camera, name)): Path<(String, String)>,
) -> Result<Response> {
    let path = state.catalog.thumbnail(&camera, &name).await?;
    range_streamer::serve(&path, &Method::GET, None).await
}

// ========================================
// Camera Handlers
// ========================================

async fn list_cameras(State(state): State<AppState>) -> impl IntoResponse {
    let cameras = state.orchestrator.list().await;
    Json(ApiResponse::success(cameras))
}

async fn get_camera(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    let camera = state.orchestrator.get(&name).await?;
    Ok(Json(ApiResponse::success(camera)))
}

async fn create_camera(
    State(state): State<AppState>,
    Json(req): Json<CameraConfig>,
) -> impl IntoResponse {
    match state.orchestrator.register(req).await {
        Ok(camera) => (StatusCode::CREATED, Json(ApiResponse::success(camera))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_camera(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.remove(&name).await {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn start_recording(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    state.orchestrator.start(&name).await?;
    Ok(Json(json!({"ok": true, "recording": true})))
}

async fn stop_recording(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    let was_recording = state.orchestrator.stop(&name).await?;
    Ok(Json(json!({"ok": true, "recording": false, "wasRecording": was_recording})))
}

#[derive(Debug, Deserialize)]
struct PushFrameQuery {
    /// Capture time in epoch milliseconds; arrival time when absent
    captured_at: Option<i64>,
}

async fn push_frame(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<PushFrameQuery>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    if body.is_empty() {
        return Err(Error::Validation("empty frame body".to_string()));
    }

    let captured_at = match query.captured_at {
        Some(ms) => DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| Error::Validation(format!("invalid captured_at: {}", ms)))?,
        None => Utc::now(),
    };

    let size = body.len();
    state.orchestrator.push_frame(&name, captured_at, body).await?;

    tracing::trace!(camera_id = %name, size = size, "Frame pushed");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"ok": true, "capturedAt": captured_at.timestamp_millis()})),
    ))
}
