//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - HTTP API routes (recordings, cameras, frame push)
//! - Request validation
//! - Response formatting

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::error::Error;
use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let cameras = state.orchestrator.list().await;
    let uptime = chrono::Utc::now() - state.started_at;

    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: uptime.num_seconds().max(0) as u64,
        cameras: cameras.len(),
        recording: cameras.iter().filter(|c| c.recording).count(),
        buffer: state.frame_buffer.stats().await,
    };

    Json(response)
}

/// Fallback for unknown routes
pub async fn not_found() -> impl IntoResponse {
    Error::NotFound("route".to_string())
}
