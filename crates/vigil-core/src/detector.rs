//! YuNet face detector via ONNX Runtime.
//!
//! The frame is letterboxed (top-left, zero padded) into a 640×640 BGR
//! float tensor. The model emits per-anchor class, objectness, box and
//! landmark maps for strides 8, 16 and 32; anchors are decoded, filtered by
//! score and suppressed with NMS.

use std::path::Path;
use std::sync::Mutex;

use image::imageops::FilterType;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

use crate::types::{FaceRegion, PixelBuffer};

const INPUT_SIDE: u32 = 640;
const STRIDES: [u32; 3] = [8, 16, 32];
pub const STRICT_SCORE: f32 = 0.9;
pub const LOOSE_SCORE: f32 = 0.6;
const NMS_IOU: f32 = 0.3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (run `vigil setup` to download models)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceDetector {
    session: Mutex<Session>,
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded YuNet model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Strict pass, then loose pass. Returns the highest-scoring face.
    pub fn locate(&self, image: &PixelBuffer) -> Result<Option<FaceRegion>, DetectorError> {
        let candidates = self.detect(image)?;
        for floor in [STRICT_SCORE, LOOSE_SCORE] {
            let kept = non_max_suppression(
                candidates.iter().filter(|c| c.confidence >= floor).cloned().collect(),
                NMS_IOU,
            );
            if let Some(best) = kept.into_iter().next() {
                tracing::debug!(score = best.confidence, floor, "YuNet face selected");
                return Ok(Some(best));
            }
        }
        Ok(None)
    }

    /// All decoded anchors above the loose floor, in frame coordinates.
    pub fn detect(&self, image: &PixelBuffer) -> Result<Vec<FaceRegion>, DetectorError> {
        let (input, scale) = preprocess(image);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let fetch = |name: String| -> Result<Vec<f32>, DetectorError> {
            let value = outputs
                .get(name.as_str())
                .ok_or_else(|| DetectorError::InferenceFailed(format!("missing output {name}")))?;
            let (_, data) = value
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("{name}: {e}")))?;
            Ok(data.to_vec())
        };

        let mut faces = Vec::new();
        for stride in STRIDES {
            let cls = fetch(format!("cls_{stride}"))?;
            let obj = fetch(format!("obj_{stride}"))?;
            let bbox = fetch(format!("bbox_{stride}"))?;
            let kps = fetch(format!("kps_{stride}"))?;
            decode_stride(stride, &cls, &obj, &bbox, &kps, scale, &mut faces);
        }
        Ok(faces)
    }
}

/// Letterbox into the model input. Returns the tensor and the frame→input scale.
fn preprocess(image: &PixelBuffer) -> (Array4<f32>, f32) {
    let longest = image.width().max(image.height()).max(1);
    let scale = INPUT_SIDE as f32 / longest as f32;
    let w = ((image.width() as f32 * scale).round() as u32).clamp(1, INPUT_SIDE);
    let h = ((image.height() as f32 * scale).round() as u32).clamp(1, INPUT_SIDE);
    let resized = image::imageops::resize(image.rgb(), w, h, FilterType::Triangle);

    let side = INPUT_SIDE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, p) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        // BGR channel order
        tensor[[0, 0, y, x]] = f32::from(p[2]);
        tensor[[0, 1, y, x]] = f32::from(p[1]);
        tensor[[0, 2, y, x]] = f32::from(p[0]);
    }
    (tensor, scale)
}

fn decode_stride(
    stride: u32,
    cls: &[f32],
    obj: &[f32],
    bbox: &[f32],
    kps: &[f32],
    scale: f32,
    out: &mut Vec<FaceRegion>,
) {
    let cols = (INPUT_SIDE / stride) as usize;
    let rows = cols;
    let anchors = (rows * cols).min(cls.len()).min(obj.len()).min(bbox.len() / 4).min(kps.len() / 10);
    let s = stride as f32;

    for idx in 0..anchors {
        let score = (cls[idx].clamp(0.0, 1.0) * obj[idx].clamp(0.0, 1.0)).sqrt();
        if score < LOOSE_SCORE {
            continue;
        }
        let c = (idx % cols) as f32;
        let r = (idx / cols) as f32;

        let cx = (c + bbox[idx * 4]) * s;
        let cy = (r + bbox[idx * 4 + 1]) * s;
        let w = bbox[idx * 4 + 2].exp() * s;
        let h = bbox[idx * 4 + 3].exp() * s;

        let mut landmarks = [(0.0f32, 0.0f32); 5];
        for (n, lm) in landmarks.iter_mut().enumerate() {
            *lm = (
                (kps[idx * 10 + 2 * n] + c) * s / scale,
                (kps[idx * 10 + 2 * n + 1] + r) * s / scale,
            );
        }

        out.push(FaceRegion {
            x: (cx - w / 2.0) / scale,
            y: (cy - h / 2.0) / scale,
            width: w / scale,
            height: h / scale,
            confidence: score,
            landmarks: Some(landmarks),
        });
    }
}

/// Greedy NMS; output sorted by score (then area) descending.
pub fn non_max_suppression(mut faces: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    faces.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then(b.area().total_cmp(&a.area()))
    });
    let mut kept: Vec<FaceRegion> = Vec::new();
    for face in faces {
        if kept.iter().all(|k| k.iou(&face) <= iou_threshold) {
            kept.push(face);
        }
    }
    kept
}
