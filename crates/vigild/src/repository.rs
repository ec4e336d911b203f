//! Persistence boundary for user records.
//!
//! Every method that changes security state is atomic per user: either a
//! single conditional `UPDATE` or one write transaction around a
//! read-transition-write sequence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::account::{EventEffect, LockoutPolicy, SecurityEvent, User};
use crate::store::StoreError;

/// Counts reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct UserCounts {
    pub users: u64,
    pub faces_registered: u64,
}

#[async_trait]
pub trait UserRepository: Send + Sync + 'static {
    /// Insert a new user. Returns `None` if the username is taken.
    async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        is_admin: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<User>, StoreError>;

    async fn load_user(&self, id: i64) -> Result<Option<User>, StoreError>;

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    /// Overwrite every mutable field of an existing user.
    async fn save_user(&self, user: &User) -> Result<(), StoreError>;

    /// `(user_id, encoding_json)` for every user with a face, except `exclude_id`.
    async fn list_users_with_face(&self, exclude_id: i64) -> Result<Vec<(i64, String)>, StoreError>;

    async fn counts(&self) -> Result<UserCounts, StoreError>;

    /// Run one security transition atomically. `None` if the user does not exist.
    async fn apply_security_event(
        &self,
        id: i64,
        event: SecurityEvent,
        policy: &LockoutPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<(User, EventEffect)>, StoreError>;

    /// Store an encoding only if none is registered. Returns whether it was stored.
    async fn set_face_encoding(&self, id: i64, encoding_json: &str) -> Result<bool, StoreError>;

    /// Replace the backup code. Returns false if the user does not exist.
    async fn store_backup_code(&self, id: i64, hash: &str, ciphertext: &[u8]) -> Result<bool, StoreError>;

    /// Clear the backup code only if it is still `hash`. Returns whether it was consumed.
    async fn consume_backup_code(&self, id: i64, hash: &str) -> Result<bool, StoreError>;

    /// Remove and return the redisplay ciphertext.
    async fn take_backup_code_ciphertext(&self, id: i64) -> Result<Option<Vec<u8>>, StoreError>;

    /// Set the session token only if no session is active.
    async fn open_session(&self, id: i64, token: &str) -> Result<bool, StoreError>;

    /// Clear the session token only if it equals `token`.
    async fn close_session(&self, id: i64, token: &str) -> Result<bool, StoreError>;

    /// Store a new password hash and clear `requires_password_reset`.
    async fn update_password(&self, id: i64, password_hash: &str) -> Result<bool, StoreError>;
}
