//! Low-level cryptographic primitives.
//!
//! This module is the only place in the crate that imports `ring` directly.
//! The pipeline stages reach digests, entropy and key derivation exclusively
//! through the functions exposed here.
//!
//! Primitive choices:
//! - **Digest**: SHA-256 (file fingerprints and key fingerprints)
//! - **Entropy**: `SystemRandom`, fresh per call
//! - **KDF**: PBKDF2-HMAC-SHA256 with a 128-bit random salt
//! - **Key size**: 256 bits (32 bytes)

use std::num::NonZeroU32;

use ring::digest::{self, SHA256};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Result, VaultError};

/// Size of a session key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Size of an initialisation vector in bytes (96 bits).
pub const IV_LEN: usize = 12;

/// Size of a KDF salt in bytes (128 bits).
pub const SALT_LEN: usize = 16;

/// Number of hex characters kept for a key fingerprint.
const FINGERPRINT_HEX_LEN: usize = 16;

/// Fill a fixed-size buffer from the system entropy source.
fn random_array<const N: usize>() -> Result<[u8; N]> {
    let rng = SystemRandom::new();
    let mut buf = [0u8; N];
    rng.fill(&mut buf).map_err(|_| VaultError::RandomnessFailure)?;
    Ok(buf)
}

/// Generate a random 256-bit session key.
pub fn generate_session_key() -> Result<[u8; KEY_LEN]> {
    random_array()
}

/// Generate a fresh initialisation vector.
pub fn generate_iv() -> Result<[u8; IV_LEN]> {
    random_array()
}

/// Generate a fresh KDF salt.
pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    random_array()
}

/// Full SHA-256 digest of `data`, hex encoded.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(digest::digest(&SHA256, data))
}

/// Deterministic content digest of a file.
///
/// When the content is available it is hashed directly. For metadata-only
/// inputs the digest covers the name and the little-endian size, so the same
/// description always yields the same fingerprint.
pub fn file_digest(name: &str, size: u64, content: Option<&[u8]>) -> String {
    match content {
        Some(bytes) => sha256_hex(bytes),
        None => {
            let mut ctx = digest::Context::new(&SHA256);
            ctx.update(name.as_bytes());
            ctx.update(&size.to_le_bytes());
            hex::encode(ctx.finish())
        }
    }
}

/// Short public fingerprint of key material.
pub fn key_fingerprint(key: &[u8]) -> String {
    let mut full = sha256_hex(key);
    full.truncate(FINGERPRINT_HEX_LEN);
    full
}

/// Derive a session key from a user secret.
pub fn derive_from_secret(
    secret: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<[u8; KEY_LEN]> {
    let iterations = NonZeroU32::new(iterations).ok_or(VaultError::KeyDerivationFailure)?;
    let mut out = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        secret.as_bytes(),
        &mut out,
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            file_digest("a.pdf", 10, None),
            file_digest("a.pdf", 10, None)
        );
        assert_ne!(
            file_digest("a.pdf", 10, None),
            file_digest("a.pdf", 11, None)
        );
    }

    #[test]
    fn fingerprint_is_short_hex() {
        let fp = key_fingerprint(&[7u8; KEY_LEN]);
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn derivation_depends_on_secret_and_salt() {
        let salt = [1u8; SALT_LEN];
        let a = derive_from_secret("correct horse", &salt, 10).unwrap();
        let b = derive_from_secret("correct horse", &salt, 10).unwrap();
        let c = derive_from_secret("wrong horse!!", &salt, 10).unwrap();
        let d = derive_from_secret("correct horse", &[2u8; SALT_LEN], 10).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn zero_iterations_rejected() {
        assert_eq!(
            derive_from_secret("secret-secret", &[0u8; SALT_LEN], 0),
            Err(VaultError::KeyDerivationFailure)
        );
    }

    #[test]
    fn random_values_differ() {
        assert_ne!(generate_iv().unwrap(), generate_iv().unwrap());
        assert_ne!(generate_session_key().unwrap(), generate_session_key().unwrap());
    }
}
