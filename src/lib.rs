//! # tcptunnel
//!
//! A private TCP tunnel. The client accepts local plaintext connections
//! (raw port forward or SOCKS5) and relays them to a remote forwarding target
//! through a stream-cipher channel keyed from a shared secret.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Frontend Layer                      │
//! │           (raw port forward, SOCKS5 CONNECT)         │
//! ├─────────────────────────────────────────────────────┤
//! │                   Relay Layer                        │
//! │       (bidirectional copy, loop prevention)          │
//! ├─────────────────────────────────────────────────────┤
//! │                Multiplexing Layer                    │
//! │     (direct framed sessions, chunked streaming)      │
//! ├─────────────────────────────────────────────────────┤
//! │                 Secure Channel                       │
//! │   (entropy handshake, daily key, AES-256-OFB)        │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │                      (TCP)                           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security caveats
//!
//! The read and write keystreams of a channel are seeded with the same key and
//! IV, and the cipher carries no authentication tag. Both properties are part
//! of the wire protocol and are kept for compatibility.

pub mod client;
pub mod config;
pub mod crypto;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tunnel listen port
pub const DEFAULT_PORT: u16 = 8443;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
