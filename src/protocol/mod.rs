//! Protocol definitions and constants

use std::time::Duration;
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Short handshake: expected {expected} bytes, got {actual}")]
    ShortHandshake { expected: usize, actual: usize },
}

/// Length of the connection entropy the dialer sends in the clear.
///
/// Both ends must agree on this value; there is no length prefix on the wire.
pub const ENTROPY_LEN: usize = 1280;

/// Bound on how long the accepting side waits for the full entropy buffer
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on raw TCP connection establishment
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive ping interval for multiplexed sessions
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// A session that has been silent this long is considered dead
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum payload carried by one multiplexing frame (32 KB)
pub const MAX_FRAME_SIZE: usize = 32768;

/// Per-stream receive buffer bound (256 KB)
pub const RECEIVE_BUFFER: usize = 262144;

/// Send credit each side of a new stream starts with (64 KB).
///
/// A receive buffer larger than this is announced with a window update as
/// soon as the stream is registered.
pub const INITIAL_WINDOW: usize = 65536;

/// Default relay copy buffer (32 KB)
pub const COPY_BUFFER_SIZE: usize = 32768;

/// First pause after a failed accept
pub const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);

/// Longest pause between accept retries
pub const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause before retrying accept after `failures` consecutive errors.
///
/// Doubles from `ACCEPT_BACKOFF_BASE` up to `ACCEPT_BACKOFF_MAX`, so a
/// persistent error such as running out of file descriptors does not spin.
pub fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_BASE
        .saturating_mul(1 << shift)
        .min(ACCEPT_BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_backoff_grows_and_caps() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(4), Duration::from_millis(80));
        assert_eq!(accept_backoff(8), ACCEPT_BACKOFF_MAX);
        assert_eq!(accept_backoff(u32::MAX), ACCEPT_BACKOFF_MAX);
        // Never a zero-length pause, even before the first counted failure.
        assert_eq!(accept_backoff(0), ACCEPT_BACKOFF_BASE);
    }
}
