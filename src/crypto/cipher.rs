//! AES-256-OFB keystream

use super::{SessionKeys, IV_LEN, KEY_LEN};
use aes::Aes256;
use ofb::cipher::{KeyIvInit, StreamCipher};
use ofb::Ofb;

type Aes256Ofb = Ofb<Aes256>;

/// One direction of a secure channel.
///
/// OFB is symmetric, so the same type encrypts the outbound direction and
/// decrypts the inbound one. Ciphertext length always equals plaintext length.
pub struct KeyStream {
    inner: Aes256Ofb,
}

impl KeyStream {
    /// Create a keystream from raw key material
    pub fn new(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Self {
        Self {
            inner: Aes256Ofb::new(key.into(), iv.into()),
        }
    }

    /// Read/write keystream pair for a channel, both seeded identically
    pub fn pair(keys: &SessionKeys) -> (Self, Self) {
        (Self::new(&keys.key, &keys.iv), Self::new(&keys.key, &keys.iv))
    }

    /// XOR the next `data.len()` keystream bytes into `data`
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }
}
