//! Credential primitives for agent authentication
//!
//! Agent secrets are stored as Argon2id hashes and verified once when an agent
//! exchanges them for a session token. Session tokens are random, opaque
//! strings; only their SHA-256 digest is ever persisted.

pub mod secret;
pub mod token;

pub use secret::{hash_secret, verify_secret, SecretError};
pub use token::{generate_id, generate_session_token, hash_token};
