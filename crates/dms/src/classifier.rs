//! Eye state and emotion classification from facial landmarks
//!
//! Both classifications are total: a landmark set missing a required index
//! resolves to the conservative default (`Closed`, `Neutral`).

use serde::{Deserialize, Serialize};

use crate::landmarks::LandmarkSet;

/// Upper contour of the left eye
pub const LEFT_EYE_UPPER: usize = 386;
/// Lower contour of the left eye
pub const LEFT_EYE_LOWER: usize = 374;
/// Top of the upper lip
pub const UPPER_LIP_TOP: usize = 13;
/// Bottom of the upper lip (inner mouth edge)
pub const UPPER_LIP_BOTTOM: usize = 14;
/// Top of the lower lip (inner mouth edge)
pub const LOWER_LIP_TOP: usize = 17;
/// Bottom of the lower lip
pub const LOWER_LIP_BOTTOM: usize = 18;

/// Eyelid gap above which the eye counts as open
pub const EYE_OPEN_THRESHOLD: f32 = 0.01;
/// Mouth openness above which a face may be happy
pub const HAPPY_MOUTH_OPEN: f32 = 0.03;
/// Curvature proxy above which a face may be happy
pub const HAPPY_CURVATURE: f32 = 0.02;
/// Mouth openness below which a face may be sad
pub const SAD_MOUTH_OPEN: f32 = 0.02;
/// Curvature proxy below which a face may be sad
pub const SAD_CURVATURE: f32 = 0.01;

/// Eye state of one face
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EyeState {
    Open,
    Closed,
}

/// Coarse facial affect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Emotion {
    Happy,
    Sad,
    Neutral,
}

/// Classification of one landmarked face
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceState {
    pub eyes: EyeState,
    pub emotion: Emotion,
}

/// Classification thresholds in normalized landmark units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierThresholds {
    pub eye_open: f32,
    pub happy_mouth_open: f32,
    pub happy_curvature: f32,
    pub sad_mouth_open: f32,
    pub sad_curvature: f32,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            eye_open: EYE_OPEN_THRESHOLD,
            happy_mouth_open: HAPPY_MOUTH_OPEN,
            happy_curvature: HAPPY_CURVATURE,
            sad_mouth_open: SAD_MOUTH_OPEN,
            sad_curvature: SAD_CURVATURE,
        }
    }
}

/// Vertical eyelid gap of the left eye
pub fn eye_gap(landmarks: &LandmarkSet) -> Option<f32> {
    let upper = landmarks.get(LEFT_EYE_UPPER)?;
    let lower = landmarks.get(LEFT_EYE_LOWER)?;
    Some((lower.y - upper.y).abs())
}

/// Vertical distance between the inner lip edges
pub fn mouth_openness(landmarks: &LandmarkSet) -> Option<f32> {
    let upper = landmarks.get(UPPER_LIP_BOTTOM)?;
    let lower = landmarks.get(LOWER_LIP_TOP)?;
    Some((lower.y - upper.y).abs())
}

/// Horizontal offset between upper-lip top and lower-lip bottom
pub fn mouth_curvature(landmarks: &LandmarkSet) -> Option<f32> {
    let top = landmarks.get(UPPER_LIP_TOP)?;
    let bottom = landmarks.get(LOWER_LIP_BOTTOM)?;
    Some((top.x - bottom.x).abs())
}

/// Stateless landmark classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct StateClassifier {
    thresholds: ClassifierThresholds,
}

impl StateClassifier {
    pub fn new(thresholds: ClassifierThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &ClassifierThresholds {
        &self.thresholds
    }

    /// Open iff the eyelid gap exceeds the threshold
    pub fn eye_state(&self, landmarks: &LandmarkSet) -> EyeState {
        match eye_gap(landmarks) {
            Some(gap) if gap > self.thresholds.eye_open => EyeState::Open,
            _ => EyeState::Closed,
        }
    }

    pub fn emotion(&self, landmarks: &LandmarkSet) -> Emotion {
        let (open, curve) = match (mouth_openness(landmarks), mouth_curvature(landmarks)) {
            (Some(open), Some(curve)) => (open, curve),
            _ => return Emotion::Neutral,
        };

        let t = &self.thresholds;
        if open > t.happy_mouth_open && curve > t.happy_curvature {
            Emotion::Happy
        } else if open < t.sad_mouth_open && curve < t.sad_curvature {
            Emotion::Sad
        } else {
            Emotion::Neutral
        }
    }

    pub fn classify(&self, landmarks: &LandmarkSet) -> FaceState {
        FaceState {
            eyes: self.eye_state(landmarks),
            emotion: self.emotion(landmarks),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::Landmark;

    fn point(x: f32, y: f32) -> Landmark {
        Landmark { x, y, z: 0.0 }
    }

    fn face(eye_gap: f32, mouth_open: f32, curvature: f32) -> LandmarkSet {
        LandmarkSet::default()
            .with_point(LEFT_EYE_UPPER, point(0.6, 0.40))
            .with_point(LEFT_EYE_LOWER, point(0.6, 0.40 + eye_gap))
            .with_point(UPPER_LIP_TOP, point(0.5, 0.70))
            .with_point(UPPER_LIP_BOTTOM, point(0.5, 0.72))
            .with_point(LOWER_LIP_TOP, point(0.5, 0.72 + mouth_open))
            .with_point(LOWER_LIP_BOTTOM, point(0.5 + curvature, 0.80))
    }

    /// Points measured from zero so each distance equals its argument exactly
    fn face_at_origin(eye_gap: f32, mouth_open: f32, curvature: f32) -> LandmarkSet {
        LandmarkSet::default()
            .with_point(LEFT_EYE_UPPER, point(0.0, 0.0))
            .with_point(LEFT_EYE_LOWER, point(0.0, eye_gap))
            .with_point(UPPER_LIP_TOP, point(0.0, 0.0))
            .with_point(UPPER_LIP_BOTTOM, point(0.0, 0.0))
            .with_point(LOWER_LIP_TOP, point(0.0, mouth_open))
            .with_point(LOWER_LIP_BOTTOM, point(curvature, 0.0))
    }

    #[test]
    fn test_eye_gap_at_threshold_is_closed() {
        let classifier = StateClassifier::default();
        let landmarks = face_at_origin(EYE_OPEN_THRESHOLD, 0.0, 0.0);
        assert_eq!(eye_gap(&landmarks), Some(EYE_OPEN_THRESHOLD));
        assert_eq!(classifier.eye_state(&landmarks), EyeState::Closed);
    }

    #[test]
    fn test_happy_bounds_are_strict() {
        let classifier = StateClassifier::default();
        let landmarks = face_at_origin(0.05, HAPPY_MOUTH_OPEN, 0.04);
        assert_eq!(mouth_openness(&landmarks), Some(HAPPY_MOUTH_OPEN));
        assert_eq!(classifier.emotion(&landmarks), Emotion::Neutral);

        let landmarks = face_at_origin(0.05, 0.05, HAPPY_CURVATURE);
        assert_eq!(classifier.emotion(&landmarks), Emotion::Neutral);
    }

    #[test]
    fn test_sad_bounds_are_strict() {
        let classifier = StateClassifier::default();
        let landmarks = face_at_origin(0.05, SAD_MOUTH_OPEN, 0.005);
        assert_eq!(mouth_openness(&landmarks), Some(SAD_MOUTH_OPEN));
        assert_eq!(classifier.emotion(&landmarks), Emotion::Neutral);

        let landmarks = face_at_origin(0.05, 0.005, SAD_CURVATURE);
        assert_eq!(mouth_curvature(&landmarks), Some(SAD_CURVATURE));
        assert_eq!(classifier.emotion(&landmarks), Emotion::Neutral);
    }

    #[test]
    fn test_eye_open_and_closed() {
        let classifier = StateClassifier::default();
        assert_eq!(classifier.eye_state(&face(0.05, 0.0, 0.0)), EyeState::Open);
        assert_eq!(classifier.eye_state(&face(0.002, 0.0, 0.0)), EyeState::Closed);
    }

    #[test]
    fn test_eye_gap_uses_absolute_distance() {
        let classifier = StateClassifier::default();
        assert_eq!(classifier.eye_state(&face(-0.05, 0.0, 0.0)), EyeState::Open);
    }

    #[test]
    fn test_missing_eye_landmarks_default_to_closed() {
        let classifier = StateClassifier::default();
        let mut landmarks = face(0.05, 0.0, 0.0);
        landmarks.remove(LEFT_EYE_LOWER);
        assert_eq!(classifier.eye_state(&landmarks), EyeState::Closed);
        assert_eq!(classifier.eye_state(&LandmarkSet::default()), EyeState::Closed);
    }

    #[test]
    fn test_emotion_table() {
        let classifier = StateClassifier::default();
        assert_eq!(classifier.emotion(&face(0.05, 0.05, 0.04)), Emotion::Happy);
        assert_eq!(classifier.emotion(&face(0.05, 0.005, 0.002)), Emotion::Sad);
        // Wide open but no curvature
        assert_eq!(classifier.emotion(&face(0.05, 0.05, 0.002)), Emotion::Neutral);
        // Between the sad and happy bands
        assert_eq!(classifier.emotion(&face(0.05, 0.025, 0.015)), Emotion::Neutral);
    }

    #[test]
    fn test_missing_mouth_landmarks_default_to_neutral() {
        let classifier = StateClassifier::default();
        for index in [UPPER_LIP_TOP, UPPER_LIP_BOTTOM, LOWER_LIP_TOP, LOWER_LIP_BOTTOM] {
            let mut landmarks = face(0.05, 0.005, 0.002);
            landmarks.remove(index);
            assert_eq!(classifier.emotion(&landmarks), Emotion::Neutral, "index {}", index);
        }
    }

    #[test]
    fn test_custom_thresholds() {
        let strict = StateClassifier::new(ClassifierThresholds {
            eye_open: 0.1,
            ..Default::default()
        });
        assert_eq!(strict.eye_state(&face(0.05, 0.0, 0.0)), EyeState::Closed);
    }

    #[test]
    fn test_classify_combines_both() {
        let state = StateClassifier::default().classify(&face(0.002, 0.05, 0.04));
        assert_eq!(
            state,
            FaceState {
                eyes: EyeState::Closed,
                emotion: Emotion::Happy
            }
        );
    }
}
