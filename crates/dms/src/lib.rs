//! Driver Monitoring System (DMS)
//!
//! Session-level driver state analysis from an uploaded video:
//! - Person localization per frame
//! - Face localization and facial landmark extraction per person
//! - Eye state (alert/drowsy) and mouth-shape affect classification
//! - Division-safe aggregation into session percentages

pub mod classifier;
pub mod config;
pub mod detector;
pub mod face;
pub mod landmarks;
pub mod session;
pub mod tally;

pub use classifier::{ClassifierThresholds, Emotion, EyeState, FaceState, StateClassifier};
pub use config::DmsConfig;
pub use detector::{
    BoundingBox, Detection, Letterbox, PersonLocalizer, YoloPersonDetector, PERSON_CLASS_ID,
};
pub use face::FaceDetector;
pub use landmarks::{FaceMeshExtractor, Landmark, LandmarkExtractor, LandmarkSet};
pub use session::{SessionError, SessionOrchestrator, SessionPhase, SessionReport};
pub use tally::{calc_percent, PerFrameTally, SessionAggregate, SessionResult};

use image::RgbImage;
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// DMS error types
#[derive(Error, Debug)]
pub enum DmsError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Image processing failed: {0}")]
    ImageProcessing(String),
}

/// Loaded model adapters, shared read-only by every session
#[derive(Clone)]
pub struct Models {
    pub localizer: Arc<dyn PersonLocalizer>,
    pub landmarks: Arc<dyn LandmarkExtractor>,
}

impl Models {
    pub fn new(localizer: Arc<dyn PersonLocalizer>, landmarks: Arc<dyn LandmarkExtractor>) -> Self {
        Self {
            localizer,
            landmarks,
        }
    }

    /// Load the ONNX models named in the configuration
    pub fn load(config: &DmsConfig) -> Result<Self, DmsError> {
        Ok(Self {
            localizer: Arc::new(YoloPersonDetector::new(config)?),
            landmarks: Arc::new(FaceMeshExtractor::new(config)?),
        })
    }
}

/// `[1, 3, H, W]` tensor of `img` with each channel value mapped by `normalize`
pub(crate) fn to_nchw(img: &RgbImage, normalize: impl Fn(u8) -> f32) -> Array4<f32> {
    let (w, h) = img.dimensions();
    let mut input = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in img.enumerate_pixels() {
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = normalize(pixel[c]);
        }
    }
    input
}

/// Build an optimized ONNX Runtime session for `path`
pub(crate) fn load_session(path: &str, threads: usize) -> Result<Session, DmsError> {
    info!("Loading model from {}", path);

    Session::builder()
        .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
        .and_then(|b| b.with_intra_threads(threads))
        .and_then(|b| b.commit_from_file(path))
        .map_err(|e| {
            error!("Failed to load model {}: {}", path, e);
            DmsError::ModelLoad(format!("{}: {}", path, e))
        })
}
