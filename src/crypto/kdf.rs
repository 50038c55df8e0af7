//! Key derivation
//!
//! Keys are plain SHA-256 compositions of the shared secret:
//!
//! ```text
//! key = SHA256( SHA256(secret) || SHA256("YYYY-MM-DD") )
//! iv  = SHA256( SHA256(secret) || entropy )[..16]
//! ```
//!
//! The key rotates at midnight UTC without any exchange. The IV changes with
//! every physical connection because the dialer picks fresh entropy.

use super::{CryptoError, IV_LEN, KEY_LEN};
use chrono::{NaiveDate, Utc};
use ring::digest::{self, Context, SHA256};

/// The current UTC calendar date
pub fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}

/// Daily salt string for `date`, zero padded
pub fn daily_salt(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn sha256_pair(first: &[u8], second: &[u8]) -> [u8; KEY_LEN] {
    let mut ctx = Context::new(&SHA256);
    ctx.update(first);
    ctx.update(second);
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(ctx.finish().as_ref());
    out
}

/// Derive the cipher key shared by every connection on `date`
pub fn derive_key(secret: &str, date: NaiveDate) -> [u8; KEY_LEN] {
    let secret_hash = digest::digest(&SHA256, secret.as_bytes());
    let salt_hash = digest::digest(&SHA256, daily_salt(date).as_bytes());
    sha256_pair(secret_hash.as_ref(), salt_hash.as_ref())
}

/// Derive the per-connection IV from the dialer's entropy
pub fn derive_iv(secret: &str, entropy: &[u8]) -> [u8; IV_LEN] {
    let secret_hash = digest::digest(&SHA256, secret.as_bytes());
    let full = sha256_pair(secret_hash.as_ref(), entropy);
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&full[..IV_LEN]);
    iv
}

/// Key material for one secure channel
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub key: [u8; KEY_LEN],
    pub iv: [u8; IV_LEN],
}

impl SessionKeys {
    /// Derive key and IV for a connection
    pub fn derive(secret: &str, date: NaiveDate, entropy: &[u8]) -> Result<Self, CryptoError> {
        if secret.is_empty() {
            return Err(CryptoError::EmptySecret);
        }
        Ok(Self {
            key: derive_key(secret, date),
            iv: derive_iv(secret, entropy),
        })
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}
