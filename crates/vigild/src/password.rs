//! Argon2id hashing for passwords and backup codes.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HashError {
    #[error("argon2 hashing failed: {0}")]
    Hash(argon2::password_hash::Error),
    #[error("hashing task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

/// Produces and checks PHC-format Argon2id strings.
///
/// Async callers use [`hash_blocking`](Self::hash_blocking) and
/// [`verify_blocking`](Self::verify_blocking), which run on the blocking pool.
#[derive(Clone)]
pub struct SecretHasher {
    argon2: Argon2<'static>,
    #[cfg(test)]
    verifications: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl Default for SecretHasher {
    fn default() -> Self {
        Self {
            argon2: Argon2::default(),
            #[cfg(test)]
            verifications: Default::default(),
        }
    }
}

impl SecretHasher {
    /// Minimum-cost parameters so tests do not spend seconds per hash.
    #[cfg(test)]
    pub fn fast() -> Self {
        let params = argon2::Params::new(8, 1, 1, None).unwrap();
        Self {
            argon2: Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params),
            verifications: Default::default(),
        }
    }

    /// Number of `verify` calls made through this hasher and its clones.
    #[cfg(test)]
    pub fn verifications(&self) -> usize {
        self.verifications.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn hash(&self, secret: &str) -> Result<String, HashError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(secret.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(HashError::Hash)
    }

    /// False on mismatch and on an unparsable stored hash.
    pub fn verify(&self, secret: &str, stored: &str) -> bool {
        #[cfg(test)]
        self.verifications.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let Ok(parsed) = PasswordHash::new(stored) else {
            tracing::warn!("stored hash is not a valid PHC string");
            return false;
        };
        self.argon2.verify_password(secret.as_bytes(), &parsed).is_ok()
    }

    /// [`hash`](Self::hash) on the blocking pool.
    pub async fn hash_blocking(&self, secret: String) -> Result<String, HashError> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.hash(&secret)).await?
    }

    /// [`verify`](Self::verify) on the blocking pool. A failed task rejects.
    pub async fn verify_blocking(&self, secret: String, stored: String) -> bool {
        let hasher = self.clone();
        match tokio::task::spawn_blocking(move || hasher.verify(&secret, &stored)).await {
            Ok(matched) => matched,
            Err(e) => {
                tracing::error!(error = %e, "hash verification task failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hasher = SecretHasher::fast();
        let hash = hasher.hash("correct horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("correct horse", &hash));
        assert!(!hasher.verify("wrong horse", &hash));
    }

    #[test]
    fn test_salted() {
        let hasher = SecretHasher::fast();
        assert_ne!(hasher.hash("pw").unwrap(), hasher.hash("pw").unwrap());
    }

    #[test]
    fn test_garbage_hash_rejects() {
        assert!(!SecretHasher::fast().verify("pw", "not-a-phc-string"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_blocking_helpers() {
        let hasher = SecretHasher::fast();
        let hash = hasher.hash_blocking("pw".to_string()).await.unwrap();
        assert!(hasher.verify_blocking("pw".to_string(), hash.clone()).await);
        assert!(!hasher.verify_blocking("other".to_string(), hash).await);
        assert_eq!(hasher.verifications(), 2);
    }
}
