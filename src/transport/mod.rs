//! Transport layer
//!
//! Provides:
//! - Raw TCP dialing with a connect timeout
//! - The stream-cipher secure channel
//! - The entropy handshake that bootstraps it (dial and listen sides)

mod handshake;
mod secure;
mod tcp;

pub use handshake::{client_handshake, dial, server_handshake, PendingHandshake, SecureListener};
pub use secure::SecureChannel;
pub use tcp::connect;

use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] crate::protocol::ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("Timeout")]
    Timeout,
}
