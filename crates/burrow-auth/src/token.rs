//! Identifier and session token generation

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{distributions::Uniform, rngs::OsRng, Rng, RngCore};
use sha2::{Digest, Sha256};

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Random lowercase alphanumeric identifier of `len` characters
///
/// Used for agent ids (15 chars) and agent secrets (48 chars).
pub fn generate_id(len: usize) -> String {
    let dist = Uniform::from(0..ID_ALPHABET.len());
    OsRng
        .sample_iter(dist)
        .take(len)
        .map(|i| ID_ALPHABET[i] as char)
        .collect()
}

/// Fresh 160-bit session token, URL-safe base64 without padding
pub fn generate_session_token() -> String {
    let mut bytes = [0u8; 20];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hex digest of a bearer token; this is the stored session id
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}
