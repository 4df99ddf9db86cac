//! Error handling for camclip

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found (camera, clip, thumbnail)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict (duplicate camera, camera already recording)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed Range header
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Range outside of the resource
    #[error("Range not satisfiable for resource of {size} bytes")]
    RangeNotSatisfiable { size: u64 },

    /// Classifier call failed
    #[error("Classifier error: {0}")]
    Classifier(String),

    /// Video encoder failed
    #[error("Encoder error: {0}")]
    Encoder(String),

    /// Frame source failure
    #[error("Stream error: {0}")]
    Stream(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Status code and machine readable code for the response body
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            Error::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            Error::InvalidRange(_) => (StatusCode::BAD_REQUEST, "INVALID_RANGE"),
            Error::RangeNotSatisfiable { .. } => {
                (StatusCode::RANGE_NOT_SATISFIABLE, "RANGE_NOT_SATISFIABLE")
            }
            Error::Classifier(_) => (StatusCode::BAD_GATEWAY, "CLASSIFIER_ERROR"),
            Error::Encoder(_) => (StatusCode::BAD_GATEWAY, "ENCODER_ERROR"),
            Error::Stream(_) => (StatusCode::BAD_GATEWAY, "STREAM_ERROR"),
            Error::Serialization(_) => (StatusCode::INTERNAL_SERVER_ERROR, "SERIALIZATION_ERROR"),
            Error::Http(_) => (StatusCode::BAD_GATEWAY, "HTTP_ERROR"),
            Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            Error::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(
                status = %status,
                error_code = %error_code,
                message = %message,
                "Request error"
            );
        } else {
            tracing::debug!(
                status = %status,
                error_code = %error_code,
                message = %message,
                "Request rejected"
            );
        }

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        match self {
            Error::RangeNotSatisfiable { size } => (
                status,
                [(header::CONTENT_RANGE, format!("bytes */{}", size))],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}
