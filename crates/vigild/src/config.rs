use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use vigil_core::{EngineSettings, SpoofThresholds};

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("VIGIL_MAX_FAILED_ATTEMPTS must be at least 1")]
    ZeroAttempts,
    #[error("VIGIL_LOCKOUT_MINUTES must be at least 1")]
    ZeroLockout,
    #[error("VIGIL_LOCKOUT_MINUTES is too large: {0}")]
    LockoutTooLong(u64),
}

/// Longest temporary lock accepted from the environment (one year).
const MAX_LOCKOUT_MINUTES: u64 = 365 * 24 * 60;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Failed attempts (face, backup code or password) before a temporary lock.
    pub max_failed_attempts: u32,
    /// Duration of a temporary lock.
    pub lockout: Duration,
    /// Embedding matcher: reject when `1 - combined similarity` reaches this.
    pub embedding_distance_threshold: f32,
    /// Histogram matcher: accept only at or above this similarity.
    pub histogram_similarity_threshold: f32,
    /// Use the cascade/LBP engine even when model files are installed.
    pub force_classic: bool,
    /// Whether the daemon is running on the session bus (development mode).
    /// Admin caller checks are skipped on the session bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `VIGIL_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let session_bus = std::env::var("VIGIL_SESSION_BUS").is_ok();

        let data_dir = if session_bus {
            std::env::var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                })
                .join("vigil")
        } else {
            PathBuf::from("/var/lib/vigil")
        };

        let model_dir = std::env::var("VIGIL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let db_path = std::env::var("VIGIL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("vigil.db"));

        Ok(Self {
            model_dir,
            db_path,
            max_failed_attempts: validate_attempts(env_u32("VIGIL_MAX_FAILED_ATTEMPTS", 3))?,
            lockout: lockout_from_minutes(env_u64("VIGIL_LOCKOUT_MINUTES", 15))?,
            embedding_distance_threshold: env_f32("VIGIL_EMBEDDING_DISTANCE_THRESHOLD", 0.30),
            histogram_similarity_threshold: env_f32("VIGIL_HISTOGRAM_SIMILARITY_THRESHOLD", 0.90),
            force_classic: std::env::var("VIGIL_FORCE_CLASSIC")
                .map(|v| v != "0")
                .unwrap_or(false),
            session_bus,
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            embedding_distance_threshold: self.embedding_distance_threshold,
            histogram_min_similarity: self.histogram_similarity_threshold,
            spoof: SpoofThresholds::default(),
        }
    }

    /// Path of the AES key protecting backup-code ciphertexts.
    pub fn key_path(&self) -> PathBuf {
        self.db_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/var/lib/vigil"))
            .join(".key")
    }
}

fn validate_attempts(max_failed_attempts: u32) -> Result<u32, ConfigError> {
    if max_failed_attempts == 0 {
        return Err(ConfigError::ZeroAttempts);
    }
    Ok(max_failed_attempts)
}

/// A zero lockout would disable locking; longer than a year would read as
/// a permanent lock.
fn lockout_from_minutes(minutes: u64) -> Result<Duration, ConfigError> {
    if minutes == 0 {
        return Err(ConfigError::ZeroLockout);
    }
    if minutes >= MAX_LOCKOUT_MINUTES {
        return Err(ConfigError::LockoutTooLong(minutes));
    }
    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or(ConfigError::LockoutTooLong(minutes))
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
