//! vigil-core: face verification pipeline.
//!
//! Decodes image payloads, locates the most prominent face, rejects
//! photo/screen replays, turns the face into a fixed-length encoding and
//! compares encodings. Two interchangeable engines implement the pipeline:
//! a trained one (YuNet detection + SFace embeddings via ONNX Runtime) and a
//! classical one (Haar-feature cascade + LBP grid histograms) used when no
//! model assets are installed.

pub mod alignment;
pub mod cascade;
pub mod codec;
pub mod detector;
pub mod engine;
pub mod lbp;
pub mod matcher;
pub mod recognizer;
pub mod spectrum;
pub mod spoof;
pub mod types;

pub use codec::{decode_payload, CodecError};
pub use engine::{ClassicFaceEngine, EngineError, EngineSettings, FaceEngine, ModelFaceEngine};
pub use matcher::{EmbeddingMatcher, HistogramMatcher, MatchError, MatchResult, Matcher};
pub use spoof::{SpoofAnalyzer, SpoofAssessment, SpoofMetrics, SpoofThresholds};
pub use types::{EncodingKind, FaceEncoding, FaceRegion, PixelBuffer};
