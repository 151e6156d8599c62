//! Facial landmark extraction

use std::collections::BTreeMap;

use ndarray::Array4;
use ort::session::Session;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use video_source::VideoFrame;

use crate::face::{face_roi, FaceDetector};
use crate::{load_session, DmsConfig, DmsError};

/// Points produced by the FaceMesh topology
pub const FACE_MESH_POINTS: usize = 468;

/// One landmark, normalized to the region it was extracted from
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    /// Relative depth, same scale as `x`
    pub z: f32,
}

/// Landmarks of a single face, addressed by topology index.
///
/// Lookups of indices the extractor did not populate return `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LandmarkSet {
    points: BTreeMap<usize, Landmark>,
}

impl LandmarkSet {
    /// Dense set indexed from 0
    pub fn from_points(points: impl IntoIterator<Item = Landmark>) -> Self {
        points.into_iter().enumerate().collect()
    }

    pub fn with_point(mut self, index: usize, landmark: Landmark) -> Self {
        self.insert(index, landmark);
        self
    }

    pub fn insert(&mut self, index: usize, landmark: Landmark) {
        self.points.insert(index, landmark);
    }

    pub fn remove(&mut self, index: usize) -> Option<Landmark> {
        self.points.remove(&index)
    }

    pub fn get(&self, index: usize) -> Option<&Landmark> {
        self.points.get(&index)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Landmark)> {
        self.points.iter().map(|(i, l)| (*i, l))
    }
}

impl FromIterator<(usize, Landmark)> for LandmarkSet {
    fn from_iter<T: IntoIterator<Item = (usize, Landmark)>>(iter: T) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

/// Extracts at most one face's landmarks from a cropped region
pub trait LandmarkExtractor: Send + Sync {
    /// `None` means no usable face in the region, which is not an error
    fn extract(&self, region: &VideoFrame) -> Result<Option<LandmarkSet>, DmsError>;
}

/// Convert raw `[x, y, z, x, y, z, ...]` model coordinates into a set
/// normalized by the model input edge
pub(crate) fn decode_mesh(coords: &[f32], input_size: u32) -> LandmarkSet {
    let scale = input_size as f32;
    coords
        .chunks_exact(3)
        .take(FACE_MESH_POINTS)
        .map(|c| Landmark {
            x: c[0] / scale,
            y: c[1] / scale,
            z: c[2] / scale,
        })
        .enumerate()
        .collect()
}

/// Re-express landmarks normalized to `roi` (`x, y, w, h` in region pixels)
/// as landmarks normalized to the whole `width` x `height` region
pub(crate) fn map_to_region(
    landmarks: &LandmarkSet,
    roi: (u32, u32, u32, u32),
    width: u32,
    height: u32,
) -> LandmarkSet {
    let (rx, ry, rw, rh) = roi;
    let (width, height) = (width.max(1) as f32, height.max(1) as f32);
    landmarks
        .iter()
        .map(|(i, l)| {
            let mapped = Landmark {
                x: (rx as f32 + l.x * rw as f32) / width,
                y: (ry as f32 + l.y * rh as f32) / height,
                z: l.z * rw as f32 / width,
            };
            (i, mapped)
        })
        .collect()
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Face detection followed by the FaceMesh landmark regressor, both run
/// through ONNX Runtime
pub struct FaceMeshExtractor {
    face: FaceDetector,
    session: Session,
    input_size: u32,
    presence_threshold: f32,
    min_crop_px: u32,
    crop_scale: f32,
}

impl FaceMeshExtractor {
    pub fn new(config: &DmsConfig) -> Result<Self, DmsError> {
        let path = config
            .landmark_model_path
            .as_deref()
            .ok_or_else(|| DmsError::Config("landmark_model_path is not set".into()))?;

        Ok(Self {
            face: FaceDetector::new(config)?,
            session: load_session(path, config.intra_threads)?,
            input_size: config.landmark_input_size,
            presence_threshold: config.face_presence_threshold,
            min_crop_px: config.min_crop_px,
            crop_scale: config.face_crop_scale,
        })
    }

    /// Resize the face crop to the model input and scale to 0..1, NHWC
    fn preprocess(&self, face: &VideoFrame) -> Result<Array4<f32>, DmsError> {
        let img = face
            .as_image()
            .ok_or_else(|| DmsError::ImageProcessing("Failed to create image buffer".into()))?;

        let size = self.input_size;
        let resized = image::imageops::resize(&img, size, size, image::imageops::FilterType::Triangle);

        let mut input = Array4::<f32>::zeros((1, size as usize, size as usize, 3));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                input[[0, y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
            }
        }
        Ok(input)
    }

    /// Mesh of a face-centered crop, normalized to that crop
    fn mesh(&self, face: &VideoFrame) -> Result<Option<LandmarkSet>, DmsError> {
        let input = self.preprocess(face)?;
        let outputs = self
            .session
            .run(ort::inputs![input].map_err(|e| DmsError::Inference(e.to_string()))?)
            .map_err(|e| DmsError::Inference(e.to_string()))?;

        // Landmark and face-flag outputs are told apart by size
        let mut coords: Option<Vec<f32>> = None;
        let mut flag: Option<f32> = None;
        for i in 0..outputs.len() {
            let tensor = outputs[i]
                .try_extract_tensor::<f32>()
                .map_err(|e| DmsError::Inference(e.to_string()))?;
            match tensor.len() {
                1 => flag = tensor.iter().next().copied(),
                n if n >= 3 => coords = Some(tensor.iter().copied().collect()),
                _ => {}
            }
        }

        let coords = coords.ok_or_else(|| DmsError::Inference("no landmark output".into()))?;
        if let Some(flag) = flag {
            let presence = sigmoid(flag);
            if presence < self.presence_threshold {
                debug!("Face presence {:.2} below threshold", presence);
                return Ok(None);
            }
        } else {
            warn!("Landmark model has no face flag output, accepting landmarks");
        }

        Ok(Some(decode_mesh(&coords, self.input_size)))
    }
}

impl LandmarkExtractor for FaceMeshExtractor {
    fn extract(&self, region: &VideoFrame) -> Result<Option<LandmarkSet>, DmsError> {
        if region.width.min(region.height) < self.min_crop_px {
            debug!("Crop {}x{} below minimum size", region.width, region.height);
            return Ok(None);
        }

        let Some(face) = self.face.detect(region)? else {
            debug!("No face in {}x{} region", region.width, region.height);
            return Ok(None);
        };

        let roi = match face_roi(&face, self.crop_scale, region.width, region.height) {
            Some(roi) if roi.2.min(roi.3) >= self.min_crop_px => roi,
            _ => {
                debug!("Face box {:?} too small or outside region", face);
                return Ok(None);
            }
        };
        let Some(crop) = region.crop(roi.0, roi.1, roi.2, roi.3) else {
            return Ok(None);
        };

        Ok(self
            .mesh(&crop)?
            .map(|landmarks| map_to_region(&landmarks, roi, region.width, region.height)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_lookup() {
        let set = LandmarkSet::default().with_point(
            374,
            Landmark {
                x: 0.1,
                y: 0.2,
                z: 0.0,
            },
        );
        assert_eq!(set.len(), 1);
        assert!(set.get(374).is_some());
        assert!(set.get(386).is_none());
        assert!(set.get(10_000).is_none());
    }

    #[test]
    fn test_from_points_is_dense() {
        let set = LandmarkSet::from_points((0..5).map(|i| Landmark {
            x: i as f32,
            y: 0.0,
            z: 0.0,
        }));
        let indices: Vec<usize> = set.iter().map(|(i, _)| i).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(set.get(3).unwrap().x, 3.0);
    }

    #[test]
    fn test_decode_mesh_normalizes_by_input_size() {
        let coords = [96.0, 48.0, 19.2, 192.0, 0.0, -9.6];
        let set = decode_mesh(&coords, 192);

        assert_eq!(set.len(), 2);
        let first = set.get(0).unwrap();
        assert!((first.x - 0.5).abs() < 1e-6);
        assert!((first.y - 0.25).abs() < 1e-6);
        assert!((first.z - 0.1).abs() < 1e-6);
        assert!((set.get(1).unwrap().x - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_mesh_ignores_trailing_values() {
        let coords = vec![1.0; FACE_MESH_POINTS * 3 + 2];
        assert_eq!(decode_mesh(&coords, 192).len(), FACE_MESH_POINTS);
    }

    #[test]
    fn test_map_to_region() {
        let crop_local = LandmarkSet::default()
            .with_point(0, Landmark { x: 0.0, y: 0.0, z: 0.0 })
            .with_point(1, Landmark { x: 0.5, y: 0.5, z: 0.1 })
            .with_point(2, Landmark { x: 1.0, y: 1.0, z: 0.0 });
        // 40x20 face crop at (20, 10) inside an 80x100 person region
        let mapped = map_to_region(&crop_local, (20, 10, 40, 20), 80, 100);

        let near = |a: f32, b: f32| (a - b).abs() < 1e-6;
        let p0 = mapped.get(0).unwrap();
        assert!(near(p0.x, 0.25) && near(p0.y, 0.1));
        let p1 = mapped.get(1).unwrap();
        assert!(near(p1.x, 0.5) && near(p1.y, 0.2) && near(p1.z, 0.05));
        let p2 = mapped.get(2).unwrap();
        assert!(near(p2.x, 0.75) && near(p2.y, 0.3));
    }

    #[test]
    fn test_map_to_region_keeps_vertical_gaps_proportional() {
        // An eyelid gap measured in the crop shrinks by the crop/region height ratio
        let crop_local = LandmarkSet::default()
            .with_point(386, Landmark { x: 0.6, y: 0.40, z: 0.0 })
            .with_point(374, Landmark { x: 0.6, y: 0.44, z: 0.0 });
        let mapped = map_to_region(&crop_local, (0, 0, 50, 50), 50, 100);

        let gap = mapped.get(374).unwrap().y - mapped.get(386).unwrap().y;
        assert!((gap - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_sigmoid_midpoint() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(8.0) > 0.99);
    }
}
