//! Video upload route

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::StatusCode,
    Json,
};
use dms::{SessionError, SessionResult};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::AppState;

/// Multipart field carrying the video
pub const VIDEO_FIELD: &str = "video";

/// Body-limit overruns are 413, anything else a malformed upload
fn upload_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::TooLarge(e.body_text())
    } else {
        ApiError::BadUpload(e.body_text())
    }
}

/// Decrements the in-flight counter when the request ends
struct InFlight<'a>(&'a AppState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a AppState) -> Self {
        state.in_flight.fetch_add(1, Ordering::Relaxed);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Analyze an uploaded video and return session percentages
pub async fn upload(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<SessionResult>, ApiError> {
    let mut multipart = match multipart {
        Ok(m) => m,
        Err(rejection) => {
            debug!("Not a multipart upload: {}", rejection);
            return Err(SessionError::MissingVideo.into());
        }
    };

    let mut video = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(upload_error)?
    {
        if field.name() == Some(VIDEO_FIELD) {
            let bytes = field.bytes().await.map_err(upload_error)?;
            video = Some(bytes);
            break;
        }
    }

    let video = match video {
        Some(bytes) if !bytes.is_empty() => bytes,
        _ => return Err(SessionError::MissingVideo.into()),
    };
    info!("Received video upload ({} bytes)", video.len());

    let _in_flight = InFlight::enter(&state);
    let orchestrator = Arc::clone(&state.orchestrator);
    let result = tokio::task::spawn_blocking(move || orchestrator.run(&video))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    info!("Video processing complete: {:?}", result);
    Ok(Json(result))
}
