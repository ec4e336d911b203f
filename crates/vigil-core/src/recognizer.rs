//! SFace face recognizer via ONNX Runtime.
//!
//! Extracts 128-dimensional embeddings from landmark-aligned 112×112 RGB
//! crops. Pixel values are fed unnormalized (0–255).

use std::path::Path;
use std::sync::Mutex;

use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

use crate::alignment::{self, ALIGNED_SIDE};
use crate::types::{FaceEncoding, FaceRegion, PixelBuffer, EMBEDDING_DIM};

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (run `vigil setup` to download models)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; the trained detector must supply them for alignment")]
    NoLandmarks,
    #[error("landmarks are degenerate; alignment failed")]
    AlignmentFailed,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// SFace-based face recognizer. Shared across threads; inference is serialized.
pub struct FaceRecognizer {
    session: Mutex<Session>,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded SFace model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Align the face and extract an L2-normalized embedding.
    pub fn extract(&self, image: &PixelBuffer, face: &FaceRegion) -> Result<FaceEncoding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let aligned = alignment::align_face(image.rgb(), landmarks).ok_or(RecognizerError::AlignmentFailed)?;
        let input = preprocess(&aligned);

        let mut session = self
            .session
            .lock()
            .map_err(|_| RecognizerError::InferenceFailed("session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(FaceEncoding::new(l2_normalized(raw)))
    }
}

fn l2_normalized(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

/// RGB crop → NCHW float tensor, raw 0–255 values.
fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let side = ALIGNED_SIDE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in aligned.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x >= side || y >= side {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y, x]] = f32::from(pixel[c]);
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_layout() {
        let mut crop = RgbImage::from_pixel(ALIGNED_SIDE, ALIGNED_SIDE, Rgb([10, 20, 30]));
        crop.put_pixel(5, 7, Rgb([200, 100, 50]));
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        assert_eq!(tensor[[0, 0, 0, 0]], 10.0);
        assert_eq!(tensor[[0, 2, 0, 0]], 30.0);
        assert_eq!(tensor[[0, 0, 7, 5]], 200.0);
        assert_eq!(tensor[[0, 1, 7, 5]], 100.0);
    }

    #[test]
    fn test_l2_normalized() {
        let v = l2_normalized(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalized(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_missing_model() {
        let err = FaceRecognizer::load(Path::new("/nonexistent/sface.onnx")).err().unwrap();
        assert!(matches!(err, RecognizerError::ModelNotFound(_)));
    }
}
