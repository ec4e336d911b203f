//! Single-use backup codes.
//!
//! A code is 8 characters from an alphabet without look-alike glyphs. The
//! store keeps an Argon2id hash for verification and an AES-256-GCM copy
//! that can be revealed to the user exactly once.

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use thiserror::Error;

/// Uppercase letters and digits minus `0`, `O`, `1` and `I`.
pub const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const CODE_LEN: usize = 8;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum BackupCodeError {
    #[error("key file I/O error: {0}")]
    KeyIo(std::io::Error),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptionFailed,
    #[error("stored ciphertext too short ({0} bytes)")]
    InvalidCiphertext(usize),
}

/// Draw a fresh code from the OS RNG.
pub fn generate() -> String {
    let mut rng = OsRng;
    (0..CODE_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Grouped form shown to users, e.g. `ABCD-EF23`.
pub fn display(code: &str) -> String {
    if code.len() != CODE_LEN {
        return code.to_string();
    }
    format!("{}-{}", &code[..4], &code[4..])
}

/// Canonical form of user input: uppercase, separators and whitespace
/// removed. `None` if the result is not a well-formed code.
pub fn normalize(input: &str) -> Option<String> {
    let code: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let well_formed = code.len() == CODE_LEN && code.bytes().all(|b| ALPHABET.contains(&b));
    well_formed.then_some(code)
}

/// Holds the AES key protecting revealable copies of backup codes.
pub struct BackupCodeVault {
    key: [u8; 32],
}

impl BackupCodeVault {
    pub fn from_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Load the key at `key_path`, creating it (mode 0600) on first use.
    pub fn open(key_path: &Path) -> Result<Self, BackupCodeError> {
        Ok(Self::from_key(load_or_generate_key(key_path)?))
    }

    /// Encrypt a code. Output is `nonce || ciphertext+tag`.
    pub fn seal(&self, code: &str) -> Result<Vec<u8>, BackupCodeError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let ciphertext = cipher
            .encrypt(nonce, code.as_bytes())
            .map_err(|_| BackupCodeError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn open_sealed(&self, blob: &[u8]) -> Result<String, BackupCodeError> {
        if blob.len() <= NONCE_LEN {
            return Err(BackupCodeError::InvalidCiphertext(blob.len()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| BackupCodeError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| BackupCodeError::DecryptionFailed)
    }
}

fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], BackupCodeError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(BackupCodeError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(BackupCodeError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "backup code key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded backup code key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(BackupCodeError::KeyIo)?;
        f.write_all(&key).map_err(BackupCodeError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new backup code key");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_uses_alphabet() {
        for _ in 0..50 {
            let code = generate();
            assert_eq!(code.len(), CODE_LEN);
            assert!(code.bytes().all(|b| ALPHABET.contains(&b)));
            assert_eq!(normalize(&code).as_deref(), Some(code.as_str()));
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("abcd-ef23").as_deref(), Some("ABCDEF23"));
        assert_eq!(normalize(" ABCD EF23 ").as_deref(), Some("ABCDEF23"));
        assert_eq!(display("ABCDEF23"), "ABCD-EF23");
        // `0`, `1`, `O`, `I` are not in the alphabet.
        assert_eq!(normalize("ABCD-EF01"), None);
        assert_eq!(normalize("ABC"), None);
        assert_eq!(normalize(""), None);
    }

    #[test]
    fn test_seal_roundtrip() {
        let vault = BackupCodeVault::from_key([7u8; 32]);
        let blob = vault.seal("ABCDEF23").unwrap();
        assert_eq!(vault.open_sealed(&blob).unwrap(), "ABCDEF23");

        let other = BackupCodeVault::from_key([8u8; 32]);
        assert!(matches!(other.open_sealed(&blob), Err(BackupCodeError::DecryptionFailed)));
        assert!(matches!(
            vault.open_sealed(&blob[..5]),
            Err(BackupCodeError::InvalidCiphertext(5))
        ));
    }

    #[test]
    fn test_key_file_created_once_with_private_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!(
            "vigil-key-test-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let key_path = dir.join(".key");

        let blob = BackupCodeVault::open(&key_path).unwrap().seal("ABCDEF23").unwrap();
        let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let reopened = BackupCodeVault::open(&key_path).unwrap();
        assert_eq!(reopened.open_sealed(&blob).unwrap(), "ABCDEF23");

        std::fs::write(&key_path, b"short").unwrap();
        assert!(matches!(BackupCodeVault::open(&key_path), Err(BackupCodeError::KeyIo(_))));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
