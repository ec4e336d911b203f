//! Model manifest and integrity checks for the trained face pipeline.
//!
//! The daemon runs the trained engine only when every file in [`MODELS`] is
//! present and intact; otherwise it falls back to the classical engine.
//! Digests are pinned in a `<name>.sha256` file next to each model when it
//! is first downloaded, and checked on every start.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Model file descriptor: URL, expected filename, human-readable size.
pub struct ModelFile {
    pub name: &'static str,
    pub url: &'static str,
    pub size_display: &'static str,
}

/// Index of the face detector in [`MODELS`].
pub const DETECTOR: usize = 0;
/// Index of the face recognizer in [`MODELS`].
pub const RECOGNIZER: usize = 1;

// Source: https://github.com/opencv/opencv_zoo (models/face_detection_yunet, models/face_recognition_sface)
pub const MODELS: &[ModelFile] = &[
    ModelFile {
        name: "face_detection_yunet_2023mar.onnx",
        url: "https://github.com/opencv/opencv_zoo/raw/main/models/face_detection_yunet/face_detection_yunet_2023mar.onnx",
        size_display: "227 KB",
    },
    ModelFile {
        name: "face_recognition_sface_2021dec.onnx",
        url: "https://github.com/opencv/opencv_zoo/raw/main/models/face_recognition_sface/face_recognition_sface_2021dec.onnx",
        size_display: "37 MB",
    },
];

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: &'static str, path: PathBuf },

    #[error("no pinned digest for {name} ({path}); re-run `vigil setup`")]
    MissingDigest { name: &'static str, path: PathBuf },

    #[error("failed to open model file: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write digest file: {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: &'static str,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// Path of a model inside `model_dir`.
pub fn model_path(model_dir: &Path, model: &ModelFile) -> PathBuf {
    model_dir.join(model.name)
}

/// Path of the pinned digest for a model inside `model_dir`.
pub fn digest_path(model_dir: &Path, model: &ModelFile) -> PathBuf {
    model_dir.join(format!("{}.sha256", model.name))
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| ModelIntegrityError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn verify_file_sha256(
    name: &'static str,
    path: &Path,
    expected_sha256: &str,
) -> Result<(), ModelIntegrityError> {
    if !path.exists() {
        return Err(ModelIntegrityError::MissingModel {
            name,
            path: path.to_path_buf(),
        });
    }

    let digest = sha256_file_hex(path)?;
    if !digest.eq_ignore_ascii_case(expected_sha256.trim()) {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name,
            path: path.to_path_buf(),
            expected: expected_sha256.trim().to_string(),
            got: digest,
        });
    }

    Ok(())
}

/// Record the current digest of a downloaded model. Returns the digest.
pub fn pin_digest(model_dir: &Path, model: &ModelFile) -> Result<String, ModelIntegrityError> {
    let digest = sha256_file_hex(&model_path(model_dir, model))?;
    let path = digest_path(model_dir, model);
    fs::write(&path, format!("{digest}\n")).map_err(|source| ModelIntegrityError::Write { path, source })?;
    Ok(digest)
}

/// Pinned digest for a model, if one has been recorded.
pub fn pinned_digest(model_dir: &Path, model: &ModelFile) -> Option<String> {
    fs::read_to_string(digest_path(model_dir, model))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// True when every model file exists (integrity not checked).
pub fn models_present(model_dir: &Path) -> bool {
    MODELS.iter().all(|m| model_path(model_dir, m).exists())
}

/// Check every model against its pinned digest.
pub fn verify_models_dir(model_dir: &Path) -> Result<(), ModelIntegrityError> {
    for model in MODELS {
        let path = model_path(model_dir, model);
        if !path.exists() {
            return Err(ModelIntegrityError::MissingModel {
                name: model.name,
                path,
            });
        }
        let expected = pinned_digest(model_dir, model).ok_or_else(|| ModelIntegrityError::MissingDigest {
            name: model.name,
            path: digest_path(model_dir, model),
        })?;
        verify_file_sha256(model.name, &path, &expected)?;
    }

    Ok(())
}
