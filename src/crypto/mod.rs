//! Cryptographic primitives for the tunnel
//!
//! This module provides:
//! - SHA-256 based key and IV derivation from the shared secret
//! - The AES-256-OFB keystream used by the secure channel
//! - Secure random number generation for connection entropy

mod cipher;
mod kdf;

pub use cipher::KeyStream;
pub use kdf::{daily_salt, derive_iv, derive_key, today_utc, SessionKeys};

use thiserror::Error;

/// Length of symmetric key in bytes (AES-256)
pub const KEY_LEN: usize = 32;

/// Length of the IV in bytes (one AES block)
pub const IV_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Secure random source failed")]
    Random,

    #[error("Shared secret must not be empty")]
    EmptySecret,
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Random)
}

/// Generate a fresh connection entropy buffer of `len` bytes
pub fn generate_entropy(len: usize) -> Result<Vec<u8>, CryptoError> {
    let mut entropy = vec![0u8; len];
    random_bytes(&mut entropy)?;
    Ok(entropy)
}

/// Uniform random value in `1..=max`
pub(crate) fn random_len(max: u8) -> Result<usize, CryptoError> {
    let mut b = [0u8; 1];
    random_bytes(&mut b)?;
    Ok(b[0] as usize % max as usize + 1)
}
