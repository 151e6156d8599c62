//! Face localization inside a person crop
//!
//! BlazeFace (short range) finds the face the landmark model should look at;
//! the mesh model only produces meaningful points on a face-centered input.

use ort::session::Session;
use tracing::debug;
use video_source::VideoFrame;

use crate::detector::{BoundingBox, Letterbox};
use crate::landmarks::sigmoid;
use crate::{load_session, to_nchw, DmsConfig, DmsError};

/// Values per regressor row: box (4) plus six keypoints
const REGRESSOR_LEN: usize = 16;

/// Raw scores are clipped to this range before the sigmoid
const SCORE_CLIP: f32 = 100.0;

/// Anchor center in model-input pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Anchor {
    pub cx: f32,
    pub cy: f32,
}

/// SSD anchors of the short-range model: a stride-8 layer with 2 anchors per
/// cell followed by stride-16 layers with 6 anchors per cell (896 for a
/// 128 px input).
pub(crate) fn blazeface_anchors(input_size: u32) -> Vec<Anchor> {
    const LAYERS: [(u32, usize); 2] = [(8, 2), (16, 6)];

    let mut anchors = Vec::new();
    for (stride, per_cell) in LAYERS {
        let cells = input_size.div_ceil(stride);
        for y in 0..cells {
            for x in 0..cells {
                let anchor = Anchor {
                    cx: (x as f32 + 0.5) * stride as f32,
                    cy: (y as f32 + 0.5) * stride as f32,
                };
                anchors.extend(std::iter::repeat(anchor).take(per_cell));
            }
        }
    }
    anchors
}

/// Highest-scoring face above `threshold`, in model-input pixels
pub(crate) fn decode_best_face(
    regressors: &[f32],
    scores: &[f32],
    anchors: &[Anchor],
    threshold: f32,
) -> Option<(BoundingBox, f32)> {
    regressors
        .chunks_exact(REGRESSOR_LEN)
        .zip(scores)
        .zip(anchors)
        .map(|((row, &raw), anchor)| {
            let score = sigmoid(raw.clamp(-SCORE_CLIP, SCORE_CLIP));
            let bbox = BoundingBox::from_center(anchor.cx + row[0], anchor.cy + row[1], row[2], row[3]);
            (bbox, score)
        })
        .filter(|(bbox, score)| *score >= threshold && bbox.area() > 0.0)
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// Square region around a face box, enlarged by `scale` and clamped to a
/// `width` x `height` image, as whole pixels `(x, y, w, h)`
pub(crate) fn face_roi(face: &BoundingBox, scale: f32, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let side = (face.x2 - face.x1).max(face.y2 - face.y1) * scale;
    let cx = (face.x1 + face.x2) / 2.0;
    let cy = (face.y1 + face.y2) / 2.0;
    BoundingBox::from_center(cx, cy, side, side).clamp_to(width, height)
}

/// BlazeFace detector run through ONNX Runtime
pub struct FaceDetector {
    session: Session,
    input_size: u32,
    confidence_threshold: f32,
    anchors: Vec<Anchor>,
}

impl FaceDetector {
    pub fn new(config: &DmsConfig) -> Result<Self, DmsError> {
        let path = config
            .face_model_path
            .as_deref()
            .ok_or_else(|| DmsError::Config("face_model_path is not set".into()))?;

        Ok(Self {
            session: load_session(path, config.intra_threads)?,
            input_size: config.face_input_size,
            confidence_threshold: config.face_confidence,
            anchors: blazeface_anchors(config.face_input_size),
        })
    }

    /// Best face in `region`, in region pixel coordinates
    pub fn detect(&self, region: &VideoFrame) -> Result<Option<BoundingBox>, DmsError> {
        let letterbox = Letterbox::fit(region.width, region.height, self.input_size);
        let canvas = letterbox.apply(region, [0, 0, 0])?;
        let input = to_nchw(&canvas, |v| v as f32 / 127.5 - 1.0);

        let outputs = self
            .session
            .run(ort::inputs![input].map_err(|e| DmsError::Inference(e.to_string()))?)
            .map_err(|e| DmsError::Inference(e.to_string()))?;

        // Regressors [1, 896, 16] and scores [1, 896, 1] are told apart by row width
        let mut regressors: Option<Vec<f32>> = None;
        let mut scores: Option<Vec<f32>> = None;
        for i in 0..outputs.len() {
            let tensor = outputs[i]
                .try_extract_tensor::<f32>()
                .map_err(|e| DmsError::Inference(e.to_string()))?;
            match tensor.shape().last() {
                Some(&REGRESSOR_LEN) => regressors = Some(tensor.iter().copied().collect()),
                Some(&1) => scores = Some(tensor.iter().copied().collect()),
                _ => {}
            }
        }
        let (Some(regressors), Some(scores)) = (regressors, scores) else {
            return Err(DmsError::Inference("unexpected face detector outputs".into()));
        };

        let best = decode_best_face(&regressors, &scores, &self.anchors, self.confidence_threshold);
        Ok(best.map(|(bbox, score)| {
            debug!("Face score {:.2} in {}x{} region", score, region.width, region.height);
            letterbox.box_to_source(&bbox)
        }))
    }
}
