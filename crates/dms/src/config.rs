//! DMS configuration

use serde::{Deserialize, Serialize};

use crate::classifier::ClassifierThresholds;

/// DMS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DmsConfig {
    /// Person detector model (YOLOv5-style ONNX export)
    pub person_model_path: Option<String>,

    /// Face detector model (BlazeFace short-range ONNX export)
    pub face_model_path: Option<String>,

    /// Face landmark model (FaceMesh-style ONNX export)
    pub landmark_model_path: Option<String>,

    /// Minimum person detection confidence
    pub person_confidence: f32,

    /// IoU above which overlapping detections are suppressed
    pub nms_iou_threshold: f32,

    /// Square input edge of the person detector
    pub person_input_size: u32,

    /// Square input edge of the face detector
    pub face_input_size: u32,

    /// Minimum face detection score
    pub face_confidence: f32,

    /// Side of the square landmark crop relative to the detected face box
    pub face_crop_scale: f32,

    /// Square input edge of the landmark model
    pub landmark_input_size: u32,

    /// Minimum face-presence probability for a landmark set to count
    pub face_presence_threshold: f32,

    /// Crops with a shorter edge are not sent to the landmark model
    pub min_crop_px: u32,

    /// ONNX Runtime intra-op threads per model
    pub intra_threads: usize,

    /// Eye-state and emotion thresholds
    pub thresholds: ClassifierThresholds,
}

impl Default for DmsConfig {
    fn default() -> Self {
        Self {
            person_model_path: None,
            face_model_path: None,
            landmark_model_path: None,
            person_confidence: 0.25,
            nms_iou_threshold: 0.45,
            person_input_size: 640,
            face_input_size: 128,
            face_confidence: 0.5,
            face_crop_scale: 1.5,
            landmark_input_size: 192,
            face_presence_threshold: 0.5,
            min_crop_px: 8,
            intra_threads: 1,
            thresholds: ClassifierThresholds::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_keep_classifier_constants() {
        let config = DmsConfig::default();
        assert_eq!(config.thresholds, ClassifierThresholds::default());
        assert!(config.person_model_path.is_none());
        assert_eq!(config.person_input_size, 640);
        assert_eq!(config.face_input_size, 128);
        assert!(config.face_crop_scale > 1.0);
    }
}
