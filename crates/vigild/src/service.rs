//! Authentication orchestration.
//!
//! Composes the face pipeline, the backup-code fallback and password login
//! with the per-user lockout state. Every verification outcome becomes a
//! security event applied atomically by the store; every attempt first
//! checks whether the account is allowed to try at all.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use vigil_core::{FaceEncoding, SpoofAssessment};

use crate::account::{AttemptStatus, Clock, EventEffect, LockoutPolicy, SecurityEvent, User};
use crate::backup_code::{self, BackupCodeError, BackupCodeVault};
use crate::engine::{Comparison, EngineError, EngineHandle, PipelineOutcome};
use crate::password::{HashError, SecretHasher};
use crate::repository::{UserCounts, UserRepository};
use crate::store::StoreError;

const GENERIC_FAILURE: &str = "verification failed";
/// Verified against on unknown-username logins so both branches pay one
/// Argon2 verification.
const DUMMY_PASSWORD: &str = "vigil-unknown-user";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("spoof suspected")]
    SpoofRejected,
    #[error("stored encoding is incompatible with the active engine; face must be re-registered")]
    EncodingLengthMismatch,
    #[error("face did not match")]
    NoMatch,
    #[error("face already registered to another account")]
    DuplicateFace,
    #[error("account locked for {remaining_minutes} more minute(s)")]
    AccountLocked { remaining_minutes: i64 },
    #[error("stored face encoding is corrupt: {0}")]
    CorruptStoredEncoding(serde_json::Error),
    #[error("internal verification error: {0}")]
    InternalError(String),
    #[error("user not found")]
    UserNotFound,
    #[error("face already registered")]
    AlreadyRegistered,
    #[error("no face registered")]
    NotRegistered,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("a session is already active")]
    SessionActive,
    #[error("username already taken")]
    UsernameTaken,
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
}

impl AuthError {
    /// Caller-facing text. Only lockout, missing face and non-match are
    /// reported precisely among the verification failures.
    pub fn public_message(&self) -> String {
        match self {
            Self::AccountLocked { remaining_minutes } => {
                format!("account locked; try again in {remaining_minutes} minute(s)")
            }
            Self::NoFaceDetected | Self::NoMatch => self.to_string(),
            Self::UserNotFound
            | Self::AlreadyRegistered
            | Self::NotRegistered
            | Self::SessionActive
            | Self::UsernameTaken
            | Self::InvalidInput(_) => self.to_string(),
            Self::InvalidCredentials => "invalid username or password".into(),
            Self::InvalidImage(_)
            | Self::SpoofRejected
            | Self::EncodingLengthMismatch
            | Self::DuplicateFace
            | Self::CorruptStoredEncoding(_)
            | Self::InternalError(_) => GENERIC_FAILURE.into(),
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        tracing::error!(error = %e, "store operation failed");
        Self::InternalError(e.to_string())
    }
}

impl From<HashError> for AuthError {
    fn from(e: HashError) -> Self {
        tracing::error!(error = %e, "hashing failed");
        Self::InternalError(e.to_string())
    }
}

impl From<BackupCodeError> for AuthError {
    fn from(e: BackupCodeError) -> Self {
        tracing::error!(error = %e, "backup code vault failed");
        Self::InternalError(e.to_string())
    }
}

// ── Outcomes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationOutcome {
    Registered { encoding_dims: usize },
    NoFace,
    Spoof(SpoofAssessment),
    DuplicateFace,
    AlreadyRegistered,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_dims: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

impl From<&RegistrationOutcome> for RegistrationReply {
    fn from(outcome: &RegistrationOutcome) -> Self {
        let error = match outcome {
            RegistrationOutcome::Registered { encoding_dims } => {
                return Self {
                    ok: true,
                    encoding_dims: Some(*encoding_dims),
                    error: None,
                }
            }
            RegistrationOutcome::NoFace => "NoFace",
            RegistrationOutcome::Spoof(_) => "Spoof",
            RegistrationOutcome::DuplicateFace => "DuplicateFace",
            RegistrationOutcome::AlreadyRegistered => "AlreadyRegistered",
        };
        Self {
            ok: false,
            encoding_dims: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone)]
pub enum VerificationOutcome {
    Verified(Comparison),
    SpoofRejected(SpoofAssessment),
    NoFace,
    NoMatch(Comparison),
    Locked { remaining_minutes: i64 },
    /// Pipeline error; the detail was logged.
    Failed,
}

#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub outcome: VerificationOutcome,
    pub status: AttemptStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyFaceReply {
    pub verified: bool,
    pub is_real: bool,
    pub confidence: f32,
    pub match_distance: Option<f32>,
    pub remaining_attempts: u32,
    pub account_locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    pub message: String,
}

impl From<&VerificationReport> for VerifyFaceReply {
    fn from(report: &VerificationReport) -> Self {
        let status = report.status;
        let mut reply = Self {
            verified: false,
            is_real: false,
            confidence: 0.0,
            match_distance: None,
            remaining_attempts: status.remaining_attempts,
            account_locked: status.account_locked,
            remaining_minutes: status.remaining_minutes,
            reason: None,
            message: GENERIC_FAILURE.into(),
        };
        match &report.outcome {
            VerificationOutcome::Verified(c) => {
                reply.verified = true;
                reply.is_real = true;
                reply.confidence = c.liveness.confidence;
                reply.match_distance = Some(c.result.distance);
                reply.message = "face verified".into();
            }
            VerificationOutcome::NoMatch(c) => {
                reply.is_real = true;
                reply.confidence = c.liveness.confidence;
                reply.match_distance = Some(c.result.distance);
                reply.reason = Some("no_match");
                reply.message = AuthError::NoMatch.public_message();
            }
            VerificationOutcome::SpoofRejected(assessment) => {
                reply.confidence = assessment.confidence;
            }
            VerificationOutcome::NoFace => {
                reply.reason = Some("no_face");
                reply.message = AuthError::NoFaceDetected.public_message();
            }
            VerificationOutcome::Locked { remaining_minutes } => {
                reply.reason = Some("account_locked");
                reply.message = AuthError::AccountLocked {
                    remaining_minutes: *remaining_minutes,
                }
                .public_message();
            }
            VerificationOutcome::Failed => {}
        }
        if status.account_locked && !matches!(report.outcome, VerificationOutcome::Verified(_)) {
            reply.reason = Some("account_locked");
        }
        reply
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupCodeOutcome {
    Verified,
    Rejected,
    Locked { remaining_minutes: i64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupCodeReply {
    pub verified: bool,
    pub remaining_attempts: u32,
    pub account_locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_minutes: Option<i64>,
}

impl BackupCodeReply {
    pub fn new(outcome: BackupCodeOutcome, status: AttemptStatus) -> Self {
        Self {
            verified: outcome == BackupCodeOutcome::Verified,
            remaining_attempts: status.remaining_attempts,
            account_locked: status.account_locked,
            remaining_minutes: status.remaining_minutes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginOutcome {
    pub user_id: i64,
    pub session_token: String,
    pub requires_face_registration: bool,
    pub requires_face_verification: bool,
    pub requires_password_reset: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub version: &'static str,
    pub encoding_dims: usize,
    pub users: u64,
    pub faces_registered: u64,
    pub max_failed_attempts: u32,
    pub lockout_minutes: i64,
}

// ── Service ───────────────────────────────────────────────────────────────────

/// Everything the daemon needs to authenticate a user, injected once at startup.
pub struct AuthService {
    engine: EngineHandle,
    store: Arc<dyn UserRepository>,
    vault: BackupCodeVault,
    hasher: SecretHasher,
    clock: Arc<dyn Clock>,
    policy: LockoutPolicy,
    dummy_hash: String,
}

impl AuthService {
    pub fn new(
        engine: EngineHandle,
        store: Arc<dyn UserRepository>,
        vault: BackupCodeVault,
        hasher: SecretHasher,
        clock: Arc<dyn Clock>,
        policy: LockoutPolicy,
    ) -> Result<Self, HashError> {
        let dummy_hash = hasher.hash(DUMMY_PASSWORD)?;
        Ok(Self {
            engine,
            store,
            vault,
            hasher,
            clock,
            policy,
            dummy_hash,
        })
    }

    async fn load(&self, user_id: i64) -> Result<User, AuthError> {
        self.store.load_user(user_id).await?.ok_or(AuthError::UserNotFound)
    }

    /// Apply one event through the store and log any lock it engages.
    async fn record(&self, user_id: i64, event: SecurityEvent) -> Result<(User, EventEffect), AuthError> {
        let now = self.clock.now();
        let (user, effect) = self
            .store
            .apply_security_event(user_id, event, &self.policy, now)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        if event == SecurityEvent::Failure && effect == EventEffect::Applied && user.is_locked(now) {
            tracing::warn!(
                user_id,
                failed_attempts = user.failed_attempts,
                locked_until = ?user.locked_until,
                "account locked after repeated failures"
            );
        }
        Ok((user, effect))
    }

    fn status_of(&self, user: &User) -> AttemptStatus {
        user.attempt_status(&self.policy, self.clock.now())
    }

    pub async fn create_user(&self, username: &str, password: &str, is_admin: bool) -> Result<i64, AuthError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AuthError::InvalidInput("username must not be empty"));
        }
        if password.is_empty() {
            return Err(AuthError::InvalidInput("password must not be empty"));
        }

        let hash = self.hasher.hash_blocking(password.to_owned()).await?;
        let user = self
            .store
            .create_user(username, &hash, is_admin, self.clock.now())
            .await?
            .ok_or(AuthError::UsernameTaken)?;
        tracing::info!(user_id = user.id, username, is_admin, "user created");
        Ok(user.id)
    }

    /// Password step. A wrong password counts against the shared attempt
    /// counter; a correct one never resets it.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginOutcome, AuthError> {
        let Some(user) = self.store.find_by_username(username).await? else {
            self.hasher
                .verify_blocking(password.to_owned(), self.dummy_hash.clone())
                .await;
            tracing::warn!(username, "login: unknown user");
            return Err(AuthError::InvalidCredentials);
        };

        if let Some(remaining_minutes) = user.remaining_minutes(self.clock.now()) {
            tracing::warn!(user_id = user.id, remaining_minutes, "login: account locked");
            return Err(AuthError::AccountLocked { remaining_minutes });
        }

        if !self
            .hasher
            .verify_blocking(password.to_owned(), user.password_hash.clone())
            .await
        {
            tracing::warn!(user_id = user.id, "login: wrong password");
            let (_, effect) = self.record(user.id, SecurityEvent::Failure).await?;
            if let EventEffect::Refused { remaining_minutes } = effect {
                return Err(AuthError::AccountLocked { remaining_minutes });
            }
            return Err(AuthError::InvalidCredentials);
        }

        if user.active_session_token.is_some() {
            tracing::warn!(user_id = user.id, "login: session already active");
            return Err(AuthError::SessionActive);
        }
        let token = uuid::Uuid::new_v4().to_string();
        if !self.store.open_session(user.id, &token).await? {
            tracing::warn!(user_id = user.id, "login: session opened concurrently");
            return Err(AuthError::SessionActive);
        }

        tracing::info!(user_id = user.id, "login: password accepted");
        Ok(LoginOutcome {
            user_id: user.id,
            session_token: token,
            requires_face_registration: !user.face_registered(),
            requires_face_verification: user.face_registered(),
            requires_password_reset: user.requires_password_reset,
        })
    }

    /// Close the session if `token` is the active one.
    pub async fn logout(&self, user_id: i64, token: &str) -> Result<bool, AuthError> {
        let closed = self.store.close_session(user_id, token).await?;
        if closed {
            tracing::info!(user_id, "session closed");
        } else {
            tracing::warn!(user_id, "logout: token does not match the active session");
        }
        Ok(closed)
    }

    pub async fn change_password(&self, user_id: i64, current: &str, new_password: &str) -> Result<(), AuthError> {
        if new_password.is_empty() {
            return Err(AuthError::InvalidInput("password must not be empty"));
        }
        let user = self.load(user_id).await?;
        if let Some(remaining_minutes) = user.remaining_minutes(self.clock.now()) {
            return Err(AuthError::AccountLocked { remaining_minutes });
        }
        if !self
            .hasher
            .verify_blocking(current.to_owned(), user.password_hash.clone())
            .await
        {
            tracing::warn!(user_id, "change_password: wrong current password");
            self.record(user_id, SecurityEvent::Failure).await?;
            return Err(AuthError::InvalidCredentials);
        }

        let hash = self.hasher.hash_blocking(new_password.to_owned()).await?;
        if !self.store.update_password(user_id, &hash).await? {
            return Err(AuthError::UserNotFound);
        }
        tracing::info!(user_id, "password changed");
        Ok(())
    }

    /// Enroll the user's face. Nothing here touches the attempt counter.
    pub async fn register_face(&self, user_id: i64, image: Vec<u8>) -> Result<RegistrationOutcome, AuthError> {
        let user = self.load(user_id).await?;
        if user.face_registered() {
            tracing::info!(user_id, "register_face: already registered");
            return Ok(RegistrationOutcome::AlreadyRegistered);
        }
        if let Some(remaining_minutes) = user.remaining_minutes(self.clock.now()) {
            return Err(AuthError::AccountLocked { remaining_minutes });
        }

        let probe = match self.engine.enroll(image).await {
            Ok(PipelineOutcome::Completed(probe)) => probe,
            Ok(PipelineOutcome::NoFace) => {
                tracing::info!(user_id, "register_face: no face detected");
                return Ok(RegistrationOutcome::NoFace);
            }
            Ok(PipelineOutcome::Spoof(assessment)) => {
                tracing::warn!(
                    user_id,
                    confidence = assessment.confidence,
                    reasons = ?assessment.reasons,
                    "register_face: spoof suspected"
                );
                return Ok(RegistrationOutcome::Spoof(assessment));
            }
            Err(EngineError::Codec(e)) => {
                tracing::warn!(user_id, error = %e, "register_face: invalid image");
                return Err(AuthError::InvalidImage(e.to_string()));
            }
            Err(e) => {
                tracing::error!(user_id, error = %e, "register_face: pipeline failed");
                return Err(AuthError::InternalError(e.to_string()));
            }
        };

        let mut owners = Vec::new();
        let mut gallery = Vec::new();
        for (other_id, json) in self.store.list_users_with_face(user_id).await? {
            match FaceEncoding::from_json(&json) {
                Ok(encoding) => {
                    owners.push(other_id);
                    gallery.push(encoding);
                }
                Err(e) => tracing::warn!(other_id, error = %e, "duplicate scan: skipping corrupt encoding"),
            }
        }
        let duplicate = self
            .engine
            .find_duplicate(probe.encoding.clone(), gallery)
            .await
            .map_err(|e| AuthError::InternalError(e.to_string()))?;
        if let Some(index) = duplicate {
            tracing::warn!(user_id, other_user_id = owners[index], "register_face: face belongs to another account");
            return Ok(RegistrationOutcome::DuplicateFace);
        }

        let json = probe
            .encoding
            .to_json()
            .map_err(|e| AuthError::InternalError(e.to_string()))?;
        if !self.store.set_face_encoding(user_id, &json).await? {
            tracing::info!(user_id, "register_face: registered concurrently");
            return Ok(RegistrationOutcome::AlreadyRegistered);
        }

        tracing::info!(user_id, dims = probe.encoding.len(), "face registered");
        Ok(RegistrationOutcome::Registered {
            encoding_dims: probe.encoding.len(),
        })
    }

    /// Second factor by face. Any non-success outcome of the pipeline
    /// counts as a failed attempt.
    pub async fn verify_face(&self, user_id: i64, image: Vec<u8>) -> Result<VerificationReport, AuthError> {
        let user = self.load(user_id).await?;
        if let Some(remaining_minutes) = user.remaining_minutes(self.clock.now()) {
            tracing::warn!(user_id, remaining_minutes, "verify_face: account locked");
            return Ok(VerificationReport {
                outcome: VerificationOutcome::Locked { remaining_minutes },
                status: self.status_of(&user),
            });
        }

        let reference = match user.stored_encoding() {
            Ok(Some(encoding)) => encoding,
            Ok(None) => return Err(AuthError::NotRegistered),
            Err(e) => {
                tracing::error!(user_id, error = %e, "verify_face: stored encoding is corrupt");
                return Err(AuthError::CorruptStoredEncoding(e));
            }
        };

        let outcome = match self.engine.verify(image, reference).await {
            Ok(PipelineOutcome::Completed(c)) if c.result.is_match => VerificationOutcome::Verified(c),
            Ok(PipelineOutcome::Completed(c)) => {
                tracing::warn!(user_id, distance = c.result.distance, "verify_face: no match");
                VerificationOutcome::NoMatch(c)
            }
            Ok(PipelineOutcome::NoFace) => {
                tracing::warn!(user_id, "verify_face: no face detected");
                VerificationOutcome::NoFace
            }
            Ok(PipelineOutcome::Spoof(assessment)) => {
                tracing::warn!(
                    user_id,
                    confidence = assessment.confidence,
                    reasons = ?assessment.reasons,
                    "verify_face: spoof suspected"
                );
                VerificationOutcome::SpoofRejected(assessment)
            }
            Err(EngineError::LengthMismatch(e)) => {
                tracing::warn!(user_id, error = %e, "verify_face: stored encoding from another engine");
                return Err(AuthError::EncodingLengthMismatch);
            }
            Err(e) => {
                tracing::error!(user_id, error = %e, "verify_face: pipeline failed");
                VerificationOutcome::Failed
            }
        };

        let event = if matches!(outcome, VerificationOutcome::Verified(_)) {
            SecurityEvent::Success
        } else {
            SecurityEvent::Failure
        };
        let (user, effect) = self.record(user_id, event).await?;
        let outcome = match effect {
            EventEffect::Refused { remaining_minutes } => VerificationOutcome::Locked { remaining_minutes },
            EventEffect::Applied => outcome,
        };
        if matches!(outcome, VerificationOutcome::Verified(_)) {
            tracing::info!(user_id, "face verified");
        }

        Ok(VerificationReport {
            outcome,
            status: self.status_of(&user),
        })
    }

    /// Issue a new backup code, replacing any previous one. Returns the
    /// display form; one further redisplay is possible through
    /// [`reveal_backup_code`](Self::reveal_backup_code).
    pub async fn generate_backup_code(&self, user_id: i64) -> Result<String, AuthError> {
        let code = backup_code::generate();
        let hash = self.hasher.hash_blocking(code.clone()).await?;
        let sealed = self.vault.seal(&code)?;
        if !self.store.store_backup_code(user_id, &hash, &sealed).await? {
            return Err(AuthError::UserNotFound);
        }
        tracing::info!(user_id, "backup code generated");
        Ok(backup_code::display(&code))
    }

    /// Show the current backup code once. `None` if it was already shown
    /// or no code exists.
    pub async fn reveal_backup_code(&self, user_id: i64) -> Result<Option<String>, AuthError> {
        let Some(sealed) = self.store.take_backup_code_ciphertext(user_id).await? else {
            return Ok(None);
        };
        let code = self.vault.open_sealed(&sealed)?;
        tracing::info!(user_id, "backup code revealed");
        Ok(Some(backup_code::display(&code)))
    }

    /// Second factor by backup code. Shares the face attempt counter.
    pub async fn verify_backup_code(
        &self,
        user_id: i64,
        input: &str,
    ) -> Result<(BackupCodeOutcome, AttemptStatus), AuthError> {
        let user = self.load(user_id).await?;
        if let Some(remaining_minutes) = user.remaining_minutes(self.clock.now()) {
            tracing::warn!(user_id, remaining_minutes, "verify_backup_code: account locked");
            return Ok((BackupCodeOutcome::Locked { remaining_minutes }, self.status_of(&user)));
        }

        let accepted = match (backup_code::normalize(input), user.backup_code_hash) {
            (Some(code), Some(hash)) => {
                if self.hasher.verify_blocking(code, hash.clone()).await {
                    self.store.consume_backup_code(user_id, &hash).await?
                } else {
                    tracing::warn!(user_id, "verify_backup_code: wrong code");
                    false
                }
            }
            (None, _) => {
                tracing::warn!(user_id, "verify_backup_code: malformed code");
                false
            }
            (_, None) => {
                tracing::warn!(user_id, "verify_backup_code: no backup code set");
                false
            }
        };

        let event = if accepted {
            SecurityEvent::Success
        } else {
            SecurityEvent::Failure
        };
        let (user, effect) = self.record(user_id, event).await?;
        let outcome = match effect {
            EventEffect::Refused { remaining_minutes } => BackupCodeOutcome::Locked { remaining_minutes },
            EventEffect::Applied if accepted => {
                tracing::info!(user_id, "backup code accepted and consumed");
                BackupCodeOutcome::Verified
            }
            EventEffect::Applied => BackupCodeOutcome::Rejected,
        };
        Ok((outcome, self.status_of(&user)))
    }

    /// Administrative unlock: the user must re-register their face and
    /// reset their password.
    pub async fn unlock_account(&self, user_id: i64) -> Result<(), AuthError> {
        self.record(user_id, SecurityEvent::AdminUnlock).await?;
        tracing::info!(user_id, "account unlocked by administrator; face erased");
        Ok(())
    }

    pub async fn disable_account(&self, user_id: i64) -> Result<(), AuthError> {
        self.record(user_id, SecurityEvent::Disable).await?;
        tracing::info!(user_id, "account disabled");
        Ok(())
    }

    pub async fn enable_account(&self, user_id: i64) -> Result<(), AuthError> {
        self.record(user_id, SecurityEvent::Enable).await?;
        tracing::info!(user_id, "account enabled");
        Ok(())
    }

    pub async fn status(&self) -> Result<ServiceStatus, AuthError> {
        let UserCounts {
            users,
            faces_registered,
        } = self.store.counts().await?;
        Ok(ServiceStatus {
            version: env!("CARGO_PKG_VERSION"),
            encoding_dims: self.engine.encoding_dims(),
            users,
            faces_registered,
            max_failed_attempts: self.policy.max_failed_attempts,
            lockout_minutes: self.policy.lockout.num_minutes(),
        })
    }
}
