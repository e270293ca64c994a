//! Agent secret hashing and verification using Argon2id

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use thiserror::Error;

/// Error types for secret operations
#[derive(Error, Debug)]
pub enum SecretError {
    #[error("Failed to hash secret: {0}")]
    HashingFailed(String),

    #[error("Failed to verify secret: {0}")]
    VerificationFailed(String),

    #[error("Invalid secret hash format: {0}")]
    InvalidHashFormat(String),
}

/// Hash an agent secret with Argon2id default parameters
///
/// Returns a PHC string (`$argon2id$v=19$...`) suitable for the `agents`
/// table.
pub fn hash_secret(secret: &str) -> Result<String, SecretError> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| SecretError::HashingFailed(e.to_string()))
}

/// Verify a presented secret against a stored PHC hash
///
/// `Ok(false)` means the secret is wrong; `Err` means the stored hash could
/// not be used at all.
pub fn verify_secret(secret: &str, hash: &str) -> Result<bool, SecretError> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| SecretError::InvalidHashFormat(e.to_string()))?;

    match Argon2::default().verify_password(secret.as_bytes(), &parsed_hash) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(SecretError::VerificationFailed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_secret_is_argon2id() {
        let hash = hash_secret("newt-secret").expect("Failed to hash secret");
        assert!(hash.starts_with("$argon2id$"));
        assert!(hash.contains("v=19"));
    }

    #[test]
    fn test_verify_secret_roundtrip() {
        let hash = hash_secret("correct-secret").expect("Failed to hash secret");

        assert!(verify_secret("correct-secret", &hash).unwrap());
        assert!(!verify_secret("wrong-secret", &hash).unwrap());
    }

    #[test]
    fn test_same_secret_hashes_differently() {
        let first = hash_secret("repeat").unwrap();
        let second = hash_secret("repeat").unwrap();
        assert_ne!(first, second, "salts must differ");
    }

    #[test]
    fn test_verify_secret_invalid_hash() {
        let result = verify_secret("anything", "not-a-phc-string");
        assert!(matches!(result, Err(SecretError::InvalidHashFormat(_))));
    }
}
