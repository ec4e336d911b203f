//! Per-user account security state and its transitions.
//!
//! Transitions are pure: they take the current [`User`], an event, the
//! lockout policy and the current time, and mutate the user in place. The
//! store runs each transition inside one write transaction so concurrent
//! attempts for the same user serialize.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use vigil_core::FaceEncoding;

/// A lock at least this many days in the future is an administrative (permanent) lock.
pub const PERMANENT_LOCK_DAYS: i64 = 365;
/// How many days ahead `disable_account` pushes the lock.
pub const DISABLE_DAYS: i64 = 3650;

/// Canonical user record. Every field has an explicit default at creation.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    /// Persisted JSON array; `None` means no face registered.
    pub face_encoding: Option<String>,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub active_session_token: Option<String>,
    pub requires_password_reset: bool,
    pub backup_code_hash: Option<String>,
    pub backup_code_ciphertext: Option<Vec<u8>>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountState {
    Active,
    Locked { until: DateTime<Utc> },
    PermanentlyLocked { until: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEvent {
    /// Failed face match, spoof, backup code, password or pipeline error.
    Failure,
    /// Successful face match or backup code.
    Success,
    AdminUnlock,
    Disable,
    Enable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub max_failed_attempts: u32,
    pub lockout: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_failed_attempts: 3,
            lockout: Duration::minutes(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventEffect {
    /// Account was locked; nothing changed.
    Refused { remaining_minutes: i64 },
    Applied,
}

/// Counter view reported to callers after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttemptStatus {
    pub remaining_attempts: u32,
    pub account_locked: bool,
    pub remaining_minutes: Option<i64>,
}

impl User {
    pub fn face_registered(&self) -> bool {
        self.face_encoding.is_some()
    }

    pub fn has_backup_code(&self) -> bool {
        self.backup_code_hash.is_some()
    }

    /// Parse the stored encoding.
    pub fn stored_encoding(&self) -> Result<Option<FaceEncoding>, serde_json::Error> {
        self.face_encoding
            .as_deref()
            .map(FaceEncoding::from_json)
            .transpose()
    }

    /// Current state. An expired temporary lock reads as `Active`.
    pub fn state(&self, now: DateTime<Utc>) -> AccountState {
        match self.locked_until {
            Some(until) if until > now => {
                if until - now >= Duration::days(PERMANENT_LOCK_DAYS) {
                    AccountState::PermanentlyLocked { until }
                } else {
                    AccountState::Locked { until }
                }
            }
            _ => AccountState::Active,
        }
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.state(now) != AccountState::Active
    }

    /// Whole minutes left on the lock, rounded up. `None` when not locked.
    pub fn remaining_minutes(&self, now: DateTime<Utc>) -> Option<i64> {
        match self.state(now) {
            AccountState::Active => None,
            AccountState::Locked { until } | AccountState::PermanentlyLocked { until } => {
                let secs = (until - now).num_seconds().max(1);
                Some((secs + 59) / 60)
            }
        }
    }

    pub fn attempt_status(&self, policy: &LockoutPolicy, now: DateTime<Utc>) -> AttemptStatus {
        let locked = self.is_locked(now);
        AttemptStatus {
            remaining_attempts: if locked {
                0
            } else {
                policy.max_failed_attempts.saturating_sub(self.failed_attempts)
            },
            account_locked: locked,
            remaining_minutes: self.remaining_minutes(now),
        }
    }

    /// Apply a security event.
    pub fn apply(&mut self, event: SecurityEvent, policy: &LockoutPolicy, now: DateTime<Utc>) -> EventEffect {
        match event {
            SecurityEvent::Failure | SecurityEvent::Success => {
                if let Some(remaining_minutes) = self.remaining_minutes(now) {
                    return EventEffect::Refused { remaining_minutes };
                }
                // A lock that has run out leaves a stale counter behind.
                if self.locked_until.take().is_some() {
                    self.failed_attempts = 0;
                }
                if event == SecurityEvent::Success {
                    self.failed_attempts = 0;
                } else {
                    self.failed_attempts += 1;
                    if self.failed_attempts >= policy.max_failed_attempts {
                        self.locked_until = Some(now + policy.lockout);
                    }
                }
            }
            SecurityEvent::AdminUnlock => {
                self.locked_until = None;
                self.failed_attempts = 0;
                self.face_encoding = None;
                self.requires_password_reset = true;
            }
            SecurityEvent::Disable => {
                self.locked_until = Some(now + Duration::days(DISABLE_DAYS));
                self.active_session_token = None;
            }
            SecurityEvent::Enable => {
                self.locked_until = None;
                self.failed_attempts = 0;
            }
        }
        EventEffect::Applied
    }
}

/// Source of the current UTC time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub struct ManualClock(std::sync::Mutex<DateTime<Utc>>);

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(std::sync::Mutex::new(start))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.0.lock().unwrap();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

#[cfg(test)]
pub fn test_user(id: i64) -> User {
    User {
        id,
        username: format!("user{id}"),
        password_hash: String::new(),
        face_encoding: None,
        failed_attempts: 0,
        locked_until: None,
        active_session_token: None,
        requires_password_reset: false,
        backup_code_hash: None,
        backup_code_ciphertext: None,
        is_admin: false,
        created_at: DateTime::from_timestamp(0, 0).unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_locks_after_max_failures() {
        let policy = LockoutPolicy::default();
        let mut user = test_user(1);
        for expected in [2, 1] {
            assert_eq!(user.apply(SecurityEvent::Failure, &policy, t0()), EventEffect::Applied);
            assert_eq!(user.attempt_status(&policy, t0()).remaining_attempts, expected);
        }
        user.apply(SecurityEvent::Failure, &policy, t0());
        assert_eq!(user.state(t0()), AccountState::Locked { until: t0() + Duration::minutes(15) });
        let status = user.attempt_status(&policy, t0());
        assert!(status.account_locked);
        assert_eq!(status.remaining_minutes, Some(15));
    }

    #[test]
    fn test_attempt_while_locked_is_refused_without_mutation() {
        let policy = LockoutPolicy::default();
        let mut user = test_user(1);
        for _ in 0..3 {
            user.apply(SecurityEvent::Failure, &policy, t0());
        }
        let before = user.clone();
        let later = t0() + Duration::seconds(61);
        assert_eq!(
            user.apply(SecurityEvent::Failure, &policy, later),
            EventEffect::Refused { remaining_minutes: 14 }
        );
        assert_eq!(
            user.apply(SecurityEvent::Success, &policy, later),
            EventEffect::Refused { remaining_minutes: 14 }
        );
        assert_eq!(user, before);
    }

    #[test]
    fn test_expired_lock_starts_fresh_window() {
        let policy = LockoutPolicy::default();
        let mut user = test_user(1);
        for _ in 0..3 {
            user.apply(SecurityEvent::Failure, &policy, t0());
        }
        let after = t0() + Duration::minutes(16);
        assert_eq!(user.state(after), AccountState::Active);

        user.apply(SecurityEvent::Failure, &policy, after);
        assert_eq!(user.failed_attempts, 1);
        assert_eq!(user.locked_until, None);
    }

    #[test]
    fn test_success_resets_counter() {
        let policy = LockoutPolicy::default();
        let mut user = test_user(1);
        user.apply(SecurityEvent::Failure, &policy, t0());
        user.apply(SecurityEvent::Failure, &policy, t0());
        user.apply(SecurityEvent::Success, &policy, t0());
        assert_eq!(user.failed_attempts, 0);
        assert_eq!(user.state(t0()), AccountState::Active);
    }

    #[test]
    fn test_success_never_clears_permanent_lock() {
        let policy = LockoutPolicy::default();
        let mut user = test_user(1);
        user.active_session_token = Some("tok".into());
        user.apply(SecurityEvent::Disable, &policy, t0());
        assert!(matches!(user.state(t0()), AccountState::PermanentlyLocked { .. }));
        assert_eq!(user.active_session_token, None);

        assert!(matches!(
            user.apply(SecurityEvent::Success, &policy, t0()),
            EventEffect::Refused { .. }
        ));
        assert!(matches!(user.state(t0()), AccountState::PermanentlyLocked { .. }));

        user.apply(SecurityEvent::Enable, &policy, t0());
        assert_eq!(user.state(t0()), AccountState::Active);
    }

    #[test]
    fn test_admin_unlock_erases_face() {
        let policy = LockoutPolicy::default();
        let mut user = test_user(1);
        user.face_encoding = Some("[0.5]".into());
        for _ in 0..3 {
            user.apply(SecurityEvent::Failure, &policy, t0());
        }
        user.apply(SecurityEvent::AdminUnlock, &policy, t0());
        assert_eq!(user.locked_until, None);
        assert_eq!(user.failed_attempts, 0);
        assert_eq!(user.face_encoding, None);
        assert!(user.requires_password_reset);
    }

    #[test]
    fn test_remaining_minutes_rounds_up() {
        let mut user = test_user(1);
        user.locked_until = Some(t0() + Duration::seconds(61));
        assert_eq!(user.remaining_minutes(t0()), Some(2));
        user.locked_until = Some(t0() + Duration::seconds(60));
        assert_eq!(user.remaining_minutes(t0()), Some(1));
        user.locked_until = Some(t0() - Duration::seconds(1));
        assert_eq!(user.remaining_minutes(t0()), None);
    }

    #[test]
    fn test_far_future_lock_is_permanent() {
        let mut user = test_user(1);
        user.locked_until = Some(t0() + Duration::days(400));
        assert!(matches!(user.state(t0()), AccountState::PermanentlyLocked { .. }));
        user.locked_until = Some(t0() + Duration::days(30));
        assert!(matches!(user.state(t0()), AccountState::Locked { .. }));
    }

    #[test]
    fn test_corrupt_encoding_reported() {
        let mut user = test_user(1);
        assert_eq!(user.stored_encoding().unwrap(), None);
        user.face_encoding = Some("[0.25, 0.5]".into());
        assert_eq!(user.stored_encoding().unwrap().unwrap().len(), 2);
        user.face_encoding = Some("not json".into());
        assert!(user.stored_encoding().is_err());
    }
}
