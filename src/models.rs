//! Shared API models

use crate::frame_buffer::BufferStats;
use serde::{Deserialize, Serialize};

/// Success envelope for JSON endpoints; failures are rendered by `Error`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self { ok: true, data }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    pub cameras: usize,
    pub recording: usize,
    pub buffer: BufferStats,
}
