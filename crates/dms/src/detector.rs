//! Person localization

use std::cmp::Ordering;

use image::{imageops, Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use serde::{Deserialize, Serialize};
use tracing::debug;
use video_source::VideoFrame;

use crate::{load_session, to_nchw, DmsConfig, DmsError};

/// COCO class id of "person"
pub const PERSON_CLASS_ID: u32 = 0;

/// Gray padding YOLOv5 letterboxes with
const LETTERBOX_FILL: [u8; 3] = [114, 114, 114];

/// Axis-aligned box in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from center, width and height
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let iy = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Whole-pixel `(x, y, w, h)` of this box clamped to a `width` x `height`
    /// frame, or `None` when nothing of it remains inside.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let clamp = |v: f32, max: u32| v.max(0.0).min(max as f32) as u32;

        let x1 = clamp(self.x1, width);
        let y1 = clamp(self.y1, height);
        let x2 = clamp(self.x2, width);
        let y2 = clamp(self.y2, height);

        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

/// Detector output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: u32,
    pub confidence: f32,
}

impl Detection {
    pub fn is_person(&self) -> bool {
        self.class_id == PERSON_CLASS_ID
    }
}

/// Object detector returning boxes of any class
pub trait PersonLocalizer: Send + Sync {
    fn detect(&self, frame: &VideoFrame) -> Result<Vec<Detection>, DmsError>;
}

/// Aspect-preserving resize of a source image into a square model input,
/// padded on the short side
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub size: u32,
    pub scale: f32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    pub fn fit(width: u32, height: u32, size: u32) -> Self {
        let scale = (size as f32 / width.max(1) as f32).min(size as f32 / height.max(1) as f32);
        let resized_width = ((width as f32 * scale).round() as u32).clamp(1, size);
        let resized_height = ((height as f32 * scale).round() as u32).clamp(1, size);
        Self {
            size,
            scale,
            resized_width,
            resized_height,
            pad_x: (size - resized_width) / 2,
            pad_y: (size - resized_height) / 2,
        }
    }

    /// Model-input pixel coordinates back to source pixels
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }

    pub fn box_to_source(&self, b: &BoundingBox) -> BoundingBox {
        let (x1, y1) = self.to_source(b.x1, b.y1);
        let (x2, y2) = self.to_source(b.x2, b.y2);
        BoundingBox::new(x1, y1, x2, y2)
    }

    /// Resize `frame` and paste it centered on a `fill` canvas
    pub fn apply(&self, frame: &VideoFrame, fill: [u8; 3]) -> Result<RgbImage, DmsError> {
        let img = frame
            .as_image()
            .ok_or_else(|| DmsError::ImageProcessing("Failed to create image buffer".into()))?;
        let resized = imageops::resize(
            &img,
            self.resized_width,
            self.resized_height,
            imageops::FilterType::Triangle,
        );

        let mut canvas = RgbImage::from_pixel(self.size, self.size, Rgb(fill));
        imageops::replace(&mut canvas, &resized, self.pad_x as i64, self.pad_y as i64);
        Ok(canvas)
    }
}

/// Decode YOLOv5 rows `[cx, cy, w, h, objectness, class scores...]` given in
/// letterboxed input pixels, mapping boxes back into frame pixels.
pub(crate) fn decode_rows(
    data: &[f32],
    row_len: usize,
    letterbox: &Letterbox,
    confidence_threshold: f32,
) -> Vec<Detection> {
    if row_len <= 5 {
        return Vec::new();
    }

    data.chunks_exact(row_len)
        .filter_map(|row| {
            let objectness = row[4];
            let (class_id, class_score) = row[5..]
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))?;
            let confidence = objectness * class_score;
            if confidence < confidence_threshold {
                return None;
            }

            let b = BoundingBox::from_center(row[0], row[1], row[2], row[3]);
            Some(Detection {
                bbox: letterbox.box_to_source(&b),
                class_id: class_id as u32,
                confidence,
            })
        })
        .collect()
}

/// Greedy per-class NMS; result is sorted by descending confidence
pub(crate) fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == det.class_id && k.bbox.iou(&det.bbox) > iou_threshold);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}

/// YOLOv5 detector run through ONNX Runtime
pub struct YoloPersonDetector {
    session: Session,
    input_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl YoloPersonDetector {
    pub fn new(config: &DmsConfig) -> Result<Self, DmsError> {
        let path = config
            .person_model_path
            .as_deref()
            .ok_or_else(|| DmsError::Config("person_model_path is not set".into()))?;

        Ok(Self {
            session: load_session(path, config.intra_threads)?,
            input_size: config.person_input_size,
            confidence_threshold: config.person_confidence,
            iou_threshold: config.nms_iou_threshold,
        })
    }

    /// Letterbox to the square model input and scale to 0..1, NCHW
    fn preprocess(&self, frame: &VideoFrame) -> Result<(Array4<f32>, Letterbox), DmsError> {
        let letterbox = Letterbox::fit(frame.width, frame.height, self.input_size);
        let canvas = letterbox.apply(frame, LETTERBOX_FILL)?;
        Ok((to_nchw(&canvas, |v| v as f32 / 255.0), letterbox))
    }
}

impl PersonLocalizer for YoloPersonDetector {
    fn detect(&self, frame: &VideoFrame) -> Result<Vec<Detection>, DmsError> {
        let (input, letterbox) = self.preprocess(frame)?;

        let outputs = self
            .session
            .run(ort::inputs![input].map_err(|e| DmsError::Inference(e.to_string()))?)
            .map_err(|e| DmsError::Inference(e.to_string()))?;

        let predictions = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DmsError::Inference(e.to_string()))?;

        let row_len = match predictions.shape().last() {
            Some(&n) => n,
            None => return Err(DmsError::Inference("scalar detector output".into())),
        };
        let data: Vec<f32> = predictions.iter().copied().collect();

        let candidates = decode_rows(&data, row_len, &letterbox, self.confidence_threshold);
        let detections = non_max_suppression(candidates, self.iou_threshold);

        debug!("Frame {}: {} detections", frame.index, detections.len());
        Ok(detections)
    }
}
