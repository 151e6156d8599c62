//! Driver State Analyzer API Server
//!
//! Accepts a video upload, runs the DMS session pipeline on it and returns
//! alertness, drowsiness and affect percentages.

use axum::{
    extract::DefaultBodyLimit,
    http::{header::CONTENT_TYPE, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use dms::{Models, SessionOrchestrator};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use storage::TempStore;
use tower_governor::GovernorLayer;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use video_source::GstDecoder;

pub mod config;
pub mod error;
pub mod rate_limit;
mod routes;

pub use crate::config::{AppConfig, LoggingConfig, ServerConfig};
pub use crate::error::{ApiError, ServerError};
pub use crate::rate_limit::{create_governor_config, DefaultGovernorConfig, RateLimitConfig};

/// Application state shared across handlers
pub struct AppState {
    /// Session pipeline with the process-wide models
    pub orchestrator: Arc<SessionOrchestrator>,
    /// Version string
    pub version: String,
    /// Start time
    pub start_time: std::time::Instant,
    /// Uploads currently being analyzed
    pub in_flight: AtomicUsize,
    /// Prometheus handle for `/metrics`
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Create new application state
    pub fn new(orchestrator: SessionOrchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: std::time::Instant::now(),
            in_flight: AtomicUsize::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// CORS policy: one credentialed origin, GET/POST/OPTIONS, `Content-Type` only
pub fn cors_layer(allowed_origin: &str) -> Result<CorsLayer, ServerError> {
    let origin = HeaderValue::from_str(allowed_origin)
        .map_err(|e| ServerError::InvalidOrigin(format!("{}: {}", allowed_origin, e)))?;

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .allow_credentials(true))
}

/// Create the application router
pub fn create_router(
    state: Arc<AppState>,
    server: &ServerConfig,
    rate_limit: Option<Arc<DefaultGovernorConfig>>,
) -> Result<Router, ServerError> {
    let mut upload = Router::new()
        .route("/upload", post(routes::upload::upload))
        .layer(DefaultBodyLimit::max(server.max_upload_bytes));
    if let Some(config) = rate_limit {
        upload = upload.layer(GovernorLayer { config });
    }

    Ok(Router::new()
        .route("/api/v1/health", get(routes::health::health))
        .route("/metrics", get(routes::health::metrics))
        .merge(upload)
        .layer(cors_layer(&server.allowed_origin)?)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// Initialize logging
pub fn init_logging(config: &LoggingConfig) -> Result<(), ServerError> {
    let level: Level = config
        .level
        .parse()
        .map_err(|_| ServerError::Logging(format!("unknown level {:?}", config.level)))?;

    let builder = FmtSubscriber::builder().with_max_level(level).with_target(true);
    let installed = if config.json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.map_err(|e| ServerError::Logging(e.to_string()))
}

/// Load the models and build the shared state
pub fn build_state(config: &AppConfig) -> Result<AppState, ServerError> {
    let models = Models::load(&config.analysis)?;
    info!("Models loaded");

    let orchestrator = SessionOrchestrator::new(
        models,
        Arc::new(GstDecoder::new(config.decoder.clone())?),
        TempStore::new(config.storage.clone()),
        config.analysis.thresholds,
    );
    Ok(AppState::new(orchestrator))
}

/// Run the server
pub async fn run_server(config: AppConfig) -> Result<(), ServerError> {
    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;

    let state = Arc::new(build_state(&config)?.with_metrics(metrics));
    let rate_limit = if config.rate_limit.enabled {
        Some(create_governor_config(&config.rate_limit)?)
    } else {
        None
    };
    let app = create_router(state, &config.server, rate_limit)?;

    info!("Starting API server on {}", config.server.addr);

    let listener = tokio::net::TcpListener::bind(&config.server.addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use dms::{
        BoundingBox, ClassifierThresholds, Detection, DmsError, Landmark, LandmarkExtractor,
        LandmarkSet, PersonLocalizer, PERSON_CLASS_ID,
    };
    use std::path::Path;
    use storage::TempStoreConfig;
    use tower::ServiceExt;
    use video_source::{CaptureError, FrameSource, VideoDecoder, VideoFrame};

    const BOUNDARY: &str = "X-DSA-BOUNDARY";

    /// One person filling the left half of every frame
    struct HalfFrameLocalizer;

    impl PersonLocalizer for HalfFrameLocalizer {
        fn detect(&self, frame: &VideoFrame) -> Result<Vec<Detection>, DmsError> {
            Ok(vec![Detection {
                bbox: BoundingBox::new(0.0, 0.0, frame.width as f32 / 2.0, frame.height as f32),
                class_id: PERSON_CLASS_ID,
                confidence: 0.9,
            }])
        }
    }

    /// Open eyes on even frames, closed on odd ones; always neutral
    struct AlternatingEyes;

    impl LandmarkExtractor for AlternatingEyes {
        fn extract(&self, region: &VideoFrame) -> Result<Option<LandmarkSet>, DmsError> {
            let gap = if region.index % 2 == 0 { 0.05 } else { 0.0 };
            Ok(Some(
                LandmarkSet::default()
                    .with_point(386, Landmark { x: 0.5, y: 0.4, z: 0.0 })
                    .with_point(374, Landmark { x: 0.5, y: 0.4 + gap, z: 0.0 }),
            ))
        }
    }

    /// Four blank frames unless the upload starts with "bad"
    struct ContentSniffingDecoder;

    impl VideoDecoder for ContentSniffingDecoder {
        fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, CaptureError> {
            let bytes = std::fs::read(path).map_err(|e| CaptureError::Open(e.to_string()))?;
            if bytes.starts_with(b"bad") {
                return Err(CaptureError::Open("Invalid data found when processing input".into()));
            }
            Ok(Box::new((0..4u64).map(|i| Ok::<_, CaptureError>(VideoFrame::blank(32, 16, i)))))
        }
    }

    fn test_app(dir: &Path) -> Router {
        test_app_with(dir, &ServerConfig::default())
    }

    fn test_app_with(dir: &Path, server: &ServerConfig) -> Router {
        let orchestrator = SessionOrchestrator::new(
            Models::new(Arc::new(HalfFrameLocalizer), Arc::new(AlternatingEyes)),
            Arc::new(ContentSniffingDecoder),
            TempStore::new(TempStoreConfig {
                dir: Some(dir.to_path_buf()),
                ..Default::default()
            }),
            ClassifierThresholds::default(),
        );
        create_router(Arc::new(AppState::new(orchestrator)), server, None).unwrap()
    }

    fn multipart_request(field: &str, content: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"clip.mp4\"\r\nContent-Type: video/mp4\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let response = test_app(dir.path())
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions_in_flight"], 0);
    }

    #[tokio::test]
    async fn test_upload_returns_percentages() {
        let dir = tempfile::tempdir().unwrap();
        let response = test_app(dir.path())
            .oneshot(multipart_request("video", b"fake mp4 bytes"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["alertness"], 50.0);
        assert_eq!(body["drowsiness"], 50.0);
        assert_eq!(body["happy"], 0.0);
        assert_eq!(body["sad"], 0.0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_without_video_field() {
        let dir = tempfile::tempdir().unwrap();
        let response = test_app(dir.path())
            .oneshot(multipart_request("document", b"fake"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "No video file provided");
    }

    #[tokio::test]
    async fn test_upload_with_empty_video() {
        let dir = tempfile::tempdir().unwrap();
        let response = test_app(dir.path())
            .oneshot(multipart_request("video", b""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_without_multipart() {
        let dir = tempfile::tempdir().unwrap();
        let request = Request::post("/upload")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let response = test_app(dir.path()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "No video file provided");
    }

    #[tokio::test]
    async fn test_oversized_upload_is_payload_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let server = ServerConfig {
            max_upload_bytes: 256,
            ..Default::default()
        };
        let response = test_app_with(dir.path(), &server)
            .oneshot(multipart_request("video", &[7u8; 4096]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(json_body(response).await["error"]
            .as_str()
            .unwrap()
            .starts_with("Upload too large"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_video_is_client_error() {
        let dir = tempfile::tempdir().unwrap();
        let response = test_app(dir.path())
            .oneshot(multipart_request("video", b"bad bytes"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("Unreadable video"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cors_preflight_allows_configured_origin() {
        let dir = tempfile::tempdir().unwrap();
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/upload")
            .header(header::ORIGIN, "http://localhost:5173")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap();
        let response = test_app(dir.path()).oneshot(request).await.unwrap();

        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://localhost:5173");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let dir = tempfile::tempdir().unwrap();
        let response = test_app(dir.path())
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_invalid_origin_rejected() {
        assert!(matches!(cors_layer("http://bad\norigin"), Err(ServerError::InvalidOrigin(_))));
    }
}
