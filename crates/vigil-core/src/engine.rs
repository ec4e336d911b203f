//! The face pipeline capability and its two implementations.
//!
//! Which implementation runs is decided once at startup from model-asset
//! presence; callers only see `dyn FaceEngine`.

use std::path::Path;

use thiserror::Error;

use crate::cascade::CascadeLocator;
use crate::detector::{DetectorError, FaceDetector};
use crate::lbp::{self, LbpError};
use crate::matcher::{
    EmbeddingMatcher, HistogramMatcher, MatchError, MatchResult, Matcher,
    DEFAULT_EMBEDDING_DISTANCE_THRESHOLD, DEFAULT_HISTOGRAM_MIN_SIMILARITY,
};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::spoof::{SpoofAnalyzer, SpoofAssessment, SpoofThresholds};
use crate::types::{EncodingKind, FaceEncoding, FaceRegion, PixelBuffer};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("histogram extraction failed: {0}")]
    Histogram(#[from] LbpError),
}

/// Tunables shared by both engines.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub embedding_distance_threshold: f32,
    pub histogram_min_similarity: f32,
    pub spoof: SpoofThresholds,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            embedding_distance_threshold: DEFAULT_EMBEDDING_DISTANCE_THRESHOLD,
            histogram_min_similarity: DEFAULT_HISTOGRAM_MIN_SIMILARITY,
            spoof: SpoofThresholds::default(),
        }
    }
}

/// Face pipeline capability: locate, assess liveness, extract, compare.
///
/// Implementations are synchronous CPU work and must be callable from
/// several blocking threads at once.
pub trait FaceEngine: Send + Sync {
    /// Kind of encoding `extract` produces.
    fn encoding_kind(&self) -> EncodingKind;

    /// The single most prominent face, or `None`.
    fn locate(&self, image: &PixelBuffer) -> Result<Option<FaceRegion>, EngineError>;

    /// Replay check on the located face. Never fails; failures reject.
    fn assess_liveness(&self, image: &PixelBuffer, face: &FaceRegion) -> SpoofAssessment;

    fn extract(&self, image: &PixelBuffer, face: &FaceRegion) -> Result<FaceEncoding, EngineError>;

    fn compare(&self, probe: &FaceEncoding, reference: &FaceEncoding) -> Result<MatchResult, MatchError>;

    /// One-to-many duplicate scan. Returns the index of the first match.
    fn find_duplicate(&self, probe: &FaceEncoding, gallery: &[FaceEncoding]) -> Option<usize> {
        crate::matcher::find_duplicate(|p, r| self.compare(p, r), probe, gallery)
    }
}

/// Cascade detector + LBP histograms. No model assets required.
pub struct ClassicFaceEngine {
    locator: CascadeLocator,
    spoof: SpoofAnalyzer,
    matcher: HistogramMatcher,
}

impl ClassicFaceEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            locator: CascadeLocator::new(),
            spoof: SpoofAnalyzer::new(settings.spoof),
            matcher: HistogramMatcher::new(settings.histogram_min_similarity),
        }
    }
}

impl FaceEngine for ClassicFaceEngine {
    fn encoding_kind(&self) -> EncodingKind {
        EncodingKind::Histogram
    }

    fn locate(&self, image: &PixelBuffer) -> Result<Option<FaceRegion>, EngineError> {
        Ok(self.locator.locate(image))
    }

    fn assess_liveness(&self, image: &PixelBuffer, face: &FaceRegion) -> SpoofAssessment {
        self.spoof.analyze(image, face)
    }

    fn extract(&self, image: &PixelBuffer, face: &FaceRegion) -> Result<FaceEncoding, EngineError> {
        Ok(lbp::extract_histogram(image, face)?)
    }

    fn compare(&self, probe: &FaceEncoding, reference: &FaceEncoding) -> Result<MatchResult, MatchError> {
        self.matcher.compare(probe, reference)
    }
}

/// YuNet detector + SFace embeddings.
pub struct ModelFaceEngine {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    spoof: SpoofAnalyzer,
    matcher: EmbeddingMatcher,
}

impl ModelFaceEngine {
    pub fn load(detector_path: &Path, recognizer_path: &Path, settings: EngineSettings) -> Result<Self, EngineError> {
        let detector = FaceDetector::load(detector_path)?;
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        Ok(Self {
            detector,
            recognizer,
            spoof: SpoofAnalyzer::new(settings.spoof),
            matcher: EmbeddingMatcher::new(settings.embedding_distance_threshold),
        })
    }
}

impl FaceEngine for ModelFaceEngine {
    fn encoding_kind(&self) -> EncodingKind {
        EncodingKind::Embedding
    }

    fn locate(&self, image: &PixelBuffer) -> Result<Option<FaceRegion>, EngineError> {
        Ok(self.detector.locate(image)?)
    }

    fn assess_liveness(&self, image: &PixelBuffer, face: &FaceRegion) -> SpoofAssessment {
        self.spoof.analyze(image, face)
    }

    fn extract(&self, image: &PixelBuffer, face: &FaceRegion) -> Result<FaceEncoding, EngineError> {
        Ok(self.recognizer.extract(image, face)?)
    }

    fn compare(&self, probe: &FaceEncoding, reference: &FaceEncoding) -> Result<MatchResult, MatchError> {
        self.matcher.compare(probe, reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_classic_engine_kind_and_extract() {
        let engine = ClassicFaceEngine::new(EngineSettings::default());
        assert_eq!(engine.encoding_kind(), EncodingKind::Histogram);

        let img = PixelBuffer::new(RgbImage::from_fn(150, 150, |x, y| {
            let v = ((x * 13 + y * 29) % 200) as u8;
            Rgb([v, v, v])
        }));
        let region = FaceRegion {
            x: 10.0,
            y: 10.0,
            width: 120.0,
            height: 120.0,
            confidence: 1.0,
            landmarks: None,
        };
        let encoding = engine.extract(&img, &region).unwrap();
        assert_eq!(encoding.kind(), Some(EncodingKind::Histogram));

        let same = engine.compare(&encoding, &encoding).unwrap();
        assert!(same.is_match);
        assert_eq!(engine.find_duplicate(&encoding, &[encoding.clone()]), Some(0));
    }

    #[test]
    fn test_classic_engine_flat_frame() {
        let engine = ClassicFaceEngine::new(EngineSettings::default());
        let img = PixelBuffer::new(RgbImage::from_pixel(200, 200, Rgb([90, 90, 90])));
        assert!(engine.locate(&img).unwrap().is_none());
    }

    #[test]
    fn test_model_engine_requires_assets() {
        let result = ModelFaceEngine::load(
            Path::new("/nonexistent/yunet.onnx"),
            Path::new("/nonexistent/sface.onnx"),
            EngineSettings::default(),
        );
        assert!(matches!(result, Err(EngineError::Detector(DetectorError::ModelNotFound(_)))));
    }
}
