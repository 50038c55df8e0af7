//! Tunnel layer - logical streams over secure channels
//!
//! Provides:
//! - Frame encoding/decoding
//! - Direct stream multiplexing with keepalive
//! - Chunked streaming, one channel per connection
//! - Client-side lazy session reuse

mod chunked;
mod client;
mod frame;
mod session;
mod stream;

pub use chunked::{spawn_chunked, ChunkedDialer, Flag, Payload, ACK_WINDOW, CHUNK_SIZE};
pub use client::SessionClient;
pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use session::{Incoming, Session};
pub use stream::{MuxStream, StreamState};

use crate::proxy::AddrSpec;
use crate::protocol;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Keepalive timeout")]
    KeepaliveTimeout,

    #[error("Too many streams")]
    TooManyStreams,

    #[error("Flow control violation")]
    FlowControl,

    #[error("Stream closed")]
    StreamClosed,

    #[error("Stream open refused by peer (status {0})")]
    OpenRefused(u8),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// Maximum number of concurrent streams per session
pub const MAX_STREAMS: usize = 1024;

/// A duplex byte stream usable as one end of a relay
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

/// Type-erased tunnel stream
pub type BoxedStream = Box<dyn TunnelIo>;

/// Something that opens logical tunnel streams
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Open a stream. `destination` asks the far end to dial that address
    /// instead of its default forward target. When a destination is given,
    /// backends that can report the far end's dial result wait for it.
    async fn open(&self, destination: Option<AddrSpec>) -> Result<BoxedStream, TunnelError>;
}

/// Multiplexing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Many streams framed inside one secure channel
    #[default]
    Direct,
    /// One secure channel per connection carrying load/ack payloads
    Chunked,
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    /// Largest frame payload sent or accepted
    pub max_frame_size: usize,
    /// Receive window per stream. The peer stops sending on a stream once
    /// this many bytes are unread.
    pub receive_buffer: usize,
}

impl SessionConfig {
    /// Receive window actually granted per stream
    pub(crate) fn receive_window(&self) -> usize {
        self.receive_buffer
            .clamp(protocol::INITIAL_WINDOW, u32::MAX as usize)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: protocol::KEEPALIVE_INTERVAL,
            keepalive_timeout: protocol::KEEPALIVE_TIMEOUT,
            max_frame_size: protocol::MAX_FRAME_SIZE,
            receive_buffer: protocol::RECEIVE_BUFFER,
        }
    }
}
