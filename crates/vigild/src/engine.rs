use std::sync::Arc;

use thiserror::Error;
use vigil_core::{
    decode_payload, ClassicFaceEngine, CodecError, FaceEncoding, FaceEngine, MatchError, MatchResult,
    ModelFaceEngine, SpoofAssessment,
};
use vigil_models::ModelIntegrityError;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid image: {0}")]
    Codec(#[from] CodecError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] vigil_core::EngineError),
    #[error(transparent)]
    LengthMismatch(#[from] MatchError),
    #[error("model integrity check failed: {0}")]
    Integrity(#[from] ModelIntegrityError),
    #[error("pipeline task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

/// How far a pipeline run got.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome<T> {
    Completed(T),
    NoFace,
    Spoof(SpoofAssessment),
}

/// Encoding extracted from a live face.
#[derive(Debug, Clone)]
pub struct Probe {
    pub encoding: FaceEncoding,
    pub liveness: SpoofAssessment,
}

/// A live probe compared against a stored reference.
#[derive(Debug, Clone)]
pub struct Comparison {
    pub liveness: SpoofAssessment,
    pub result: MatchResult,
}

/// Clone-safe handle to the face engine selected at startup.
///
/// Every stage is synchronous CPU work, so each request runs on the
/// blocking pool and concurrent requests proceed in parallel.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<dyn FaceEngine>,
}

impl EngineHandle {
    pub fn new(engine: Arc<dyn FaceEngine>) -> Self {
        Self { engine }
    }

    pub fn encoding_dims(&self) -> usize {
        self.engine.encoding_kind().dims()
    }

    /// Decode, locate, check liveness and extract.
    pub async fn enroll(&self, payload: Vec<u8>) -> Result<PipelineOutcome<Probe>, EngineError> {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || run_probe(engine.as_ref(), &payload)).await?
    }

    /// Run the pipeline and compare the result with `reference`.
    ///
    /// A reference produced by the other engine is rejected before any
    /// image work is done.
    pub async fn verify(
        &self,
        payload: Vec<u8>,
        reference: FaceEncoding,
    ) -> Result<PipelineOutcome<Comparison>, EngineError> {
        let dims = self.encoding_dims();
        if reference.len() != dims {
            return Err(MatchError::LengthMismatch {
                probe: dims,
                reference: reference.len(),
            }
            .into());
        }

        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || {
            let probe = match run_probe(engine.as_ref(), &payload)? {
                PipelineOutcome::Completed(probe) => probe,
                PipelineOutcome::NoFace => return Ok(PipelineOutcome::NoFace),
                PipelineOutcome::Spoof(assessment) => return Ok(PipelineOutcome::Spoof(assessment)),
            };
            let result = engine.compare(&probe.encoding, &reference)?;
            tracing::debug!(
                distance = result.distance,
                similarity = result.similarity,
                is_match = result.is_match,
                "verify: compared"
            );
            Ok(PipelineOutcome::Completed(Comparison {
                liveness: probe.liveness,
                result,
            }))
        })
        .await?
    }

    /// Index of the first gallery entry matching `probe`.
    pub async fn find_duplicate(
        &self,
        probe: FaceEncoding,
        gallery: Vec<FaceEncoding>,
    ) -> Result<Option<usize>, EngineError> {
        let engine = Arc::clone(&self.engine);
        Ok(tokio::task::spawn_blocking(move || engine.find_duplicate(&probe, &gallery)).await?)
    }
}

fn run_probe(engine: &dyn FaceEngine, payload: &[u8]) -> Result<PipelineOutcome<Probe>, EngineError> {
    let image = decode_payload(payload)?;
    tracing::debug!(width = image.width(), height = image.height(), "decoded image");

    let Some(face) = engine.locate(&image)? else {
        return Ok(PipelineOutcome::NoFace);
    };
    tracing::debug!(
        x = face.x,
        y = face.y,
        width = face.width,
        height = face.height,
        confidence = face.confidence,
        "face located"
    );

    let liveness = engine.assess_liveness(&image, &face);
    tracing::debug!(
        is_real = liveness.is_real,
        confidence = liveness.confidence,
        reasons = ?liveness.reasons,
        "liveness assessed"
    );
    if !liveness.is_real {
        return Ok(PipelineOutcome::Spoof(liveness));
    }

    let encoding = engine.extract(&image, &face)?;
    Ok(PipelineOutcome::Completed(Probe { encoding, liveness }))
}

/// Pick the engine once, from what is installed in the model directory.
///
/// Installed models that fail their integrity check are a startup error,
/// not a silent fallback.
pub fn load_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let settings = config.engine_settings();

    if config.force_classic {
        tracing::info!("classic engine forced by configuration");
        return Ok(EngineHandle::new(Arc::new(ClassicFaceEngine::new(settings))));
    }

    if !vigil_models::models_present(&config.model_dir) {
        tracing::info!(
            model_dir = %config.model_dir.display(),
            "face models not installed, using cascade/LBP engine"
        );
        return Ok(EngineHandle::new(Arc::new(ClassicFaceEngine::new(settings))));
    }

    vigil_models::verify_models_dir(&config.model_dir)?;
    let detector_path = vigil_models::model_path(&config.model_dir, &vigil_models::MODELS[vigil_models::DETECTOR]);
    let recognizer_path =
        vigil_models::model_path(&config.model_dir, &vigil_models::MODELS[vigil_models::RECOGNIZER]);

    let engine = ModelFaceEngine::load(&detector_path, &recognizer_path, settings)?;
    tracing::info!(
        detector = %detector_path.display(),
        recognizer = %recognizer_path.display(),
        "trained face engine loaded"
    );
    Ok(EngineHandle::new(Arc::new(engine)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use vigil_core::EngineSettings;

    fn classic() -> EngineHandle {
        EngineHandle::new(Arc::new(ClassicFaceEngine::new(EngineSettings::default())))
    }

    fn png(img: RgbImage) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[tokio::test]
    async fn test_flat_frame_has_no_face() {
        let payload = png(RgbImage::from_pixel(200, 200, Rgb([120, 120, 120])));
        let outcome = classic().enroll(payload).await.unwrap();
        assert!(matches!(outcome, PipelineOutcome::NoFace));
    }

    #[tokio::test]
    async fn test_garbage_payload_is_codec_error() {
        let err = classic().enroll(b"definitely not an image".to_vec()).await.unwrap_err();
        assert!(matches!(err, EngineError::Codec(_)));
    }

    #[tokio::test]
    async fn test_foreign_reference_rejected_before_decode() {
        let reference = FaceEncoding::new(vec![0.1; 128]);
        let err = classic().verify(Vec::new(), reference).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::LengthMismatch(MatchError::LengthMismatch {
                probe: 1024,
                reference: 128
            })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_scan_skips_other_lengths() {
        let probe = FaceEncoding::new((0..1024).map(|i| ((i % 16) as f32 + 1.0) / 136.0).collect());
        let gallery = vec![FaceEncoding::new(vec![0.5; 128]), probe.clone()];
        assert_eq!(classic().find_duplicate(probe, gallery).await.unwrap(), Some(1));
    }
}
