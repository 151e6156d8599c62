//! API error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dms::{DmsError, SessionError};
use video_source::CaptureError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors returned from request handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Malformed upload: {0}")]
    BadUpload(String),

    #[error("Upload too large: {0}")]
    TooLarge(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Session(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            ApiError::BadUpload(_) => StatusCode::BAD_REQUEST,
            ApiError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Session(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

/// Errors while starting the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Model loading failed: {0}")]
    Models(#[from] DmsError),

    #[error("Video decoder setup failed: {0}")]
    Decoder(#[from] CaptureError),

    #[error("Invalid allowed origin: {0}")]
    InvalidOrigin(String),

    #[error("Invalid rate limit: {0}")]
    RateLimit(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Metrics setup failed: {0}")]
    Metrics(String),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}
