//! Entropy handshake
//!
//! The dialer opens a TCP connection and immediately writes
//! [`ENTROPY_LEN`] random bytes in the clear. No length prefix, no magic.
//! The listener reads exactly that many bytes. Both sides then derive the
//! same key (from the secret and the UTC date) and IV (from the secret and
//! the entropy) and switch to the secure channel.
//!
//! Nothing here authenticates the peer. A listener with the wrong secret or a
//! different calendar date completes the handshake and then reads garbage.

use super::{tcp, SecureChannel, TransportError};
use crate::crypto::{generate_entropy, today_utc, SessionKeys};
use crate::protocol::{ProtocolError, ENTROPY_LEN};
use chrono::NaiveDate;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Dial `addr` and bootstrap a secure channel over the new connection
pub async fn dial(
    addr: &str,
    secret: &str,
    timeout: Duration,
) -> Result<SecureChannel<TcpStream>, TransportError> {
    let stream = tcp::connect(addr, timeout).await?;
    debug!("Connected to {}, sending handshake", addr);
    client_handshake(stream, secret, today_utc()).await
}

/// Dialer side of the handshake over an already connected stream
pub async fn client_handshake<S>(
    mut stream: S,
    secret: &str,
    date: NaiveDate,
) -> Result<SecureChannel<S>, TransportError>
where
    S: AsyncWrite + Unpin,
{
    let entropy = generate_entropy(ENTROPY_LEN)?;
    let keys = SessionKeys::derive(secret, date, &entropy)?;

    stream.write_all(&entropy).await?;
    stream.flush().await?;

    Ok(SecureChannel::new(stream, &keys))
}

/// Listener side of the handshake. Fails if the full entropy buffer does not
/// arrive within `timeout`.
pub async fn server_handshake<S>(
    mut stream: S,
    secret: &str,
    date: NaiveDate,
    timeout: Duration,
) -> Result<SecureChannel<S>, TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut entropy = vec![0u8; ENTROPY_LEN];
    tokio::time::timeout(timeout, read_entropy(&mut stream, &mut entropy))
        .await
        .map_err(|_| TransportError::Timeout)??;

    let keys = SessionKeys::derive(secret, date, &entropy)?;
    Ok(SecureChannel::new(stream, &keys))
}

async fn read_entropy<S>(stream: &mut S, buf: &mut [u8]) -> Result<(), TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(ProtocolError::ShortHandshake {
                expected: buf.len(),
                actual: filled,
            }
            .into());
        }
        filled += n;
    }
    Ok(())
}

/// A TCP listener that hands out secure channels
pub struct SecureListener {
    listener: TcpListener,
    secret: Arc<str>,
    timeout: Duration,
}

impl SecureListener {
    /// Bind the listener. Failure here is the only fatal tunnel error.
    pub async fn bind(addr: &str, secret: &str, timeout: Duration) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Tunnel listener bound on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            secret: Arc::from(secret),
            timeout,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept a raw connection. The handshake runs in
    /// [`PendingHandshake::complete`] so callers can move it off the accept
    /// loop.
    pub async fn accept(&self) -> Result<PendingHandshake, TransportError> {
        let (stream, peer_addr) = self.listener.accept().await?;
        stream.set_nodelay(true).ok();
        debug!("Accepted raw connection from {}", peer_addr);
        Ok(PendingHandshake {
            stream,
            peer_addr,
            secret: Arc::clone(&self.secret),
            timeout: self.timeout,
        })
    }

    /// Accept the next connection that completes the handshake.
    ///
    /// Connections that fail the handshake are closed and skipped.
    pub async fn accept_secure(&self) -> Result<(SecureChannel<TcpStream>, SocketAddr), TransportError> {
        loop {
            let pending = self.accept().await?;
            let peer_addr = pending.peer_addr();
            match pending.complete().await {
                Ok(channel) => return Ok((channel, peer_addr)),
                Err(e) => warn!("Handshake with {} failed: {}", peer_addr, e),
            }
        }
    }
}

/// A raw accepted connection that has not sent its entropy yet
pub struct PendingHandshake {
    stream: TcpStream,
    peer_addr: SocketAddr,
    secret: Arc<str>,
    timeout: Duration,
}

impl PendingHandshake {
    /// Remote address of the dialer
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read the entropy and build the channel. On error the raw connection is
    /// dropped, which closes it.
    pub async fn complete(self) -> Result<SecureChannel<TcpStream>, TransportError> {
        server_handshake(self.stream, &self.secret, today_utc(), self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 8, 20).unwrap()
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let mut ch = server_handshake(b, "secret", date(), Duration::from_secs(5))
                .await
                .unwrap();
            let mut buf = [0u8; 5];
            ch.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut client = client_handshake(a, "secret", date()).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        assert_eq!(&server.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_entropy_sent_first_and_fresh() {
        let mut seen = Vec::new();
        for _ in 0..2 {
            let (a, mut raw) = tokio::io::duplex(4096);
            let client = client_handshake(a, "secret", date()).await.unwrap();
            drop(client);

            let mut wire = Vec::new();
            raw.read_to_end(&mut wire).await.unwrap();
            assert_eq!(wire.len(), ENTROPY_LEN);
            seen.push(wire);
        }
        assert_ne!(seen[0], seen[1]);
        assert_ne!(
            crate::crypto::derive_iv("secret", &seen[0]),
            crate::crypto::derive_iv("secret", &seen[1])
        );
    }

    #[tokio::test]
    async fn test_short_handshake_fails() {
        let (mut a, b) = tokio::io::duplex(4096);
        a.write_all(&[0u8; 100]).await.unwrap();
        drop(a);

        let result = server_handshake(b, "secret", date(), Duration::from_secs(5)).await;
        assert!(matches!(
            result,
            Err(TransportError::Handshake(ProtocolError::ShortHandshake {
                expected: ENTROPY_LEN,
                actual: 100
            }))
        ));
    }

    #[tokio::test]
    async fn test_handshake_deadline() {
        let (_a, b) = tokio::io::duplex(4096);
        let result = server_handshake(b, "secret", date(), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_listener_survives_failed_handshake() {
        let listener = SecureListener::bind("127.0.0.1:0", "secret", Duration::from_millis(200))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut ch, _) = listener.accept_secure().await.unwrap();
            let mut buf = [0u8; 2];
            ch.read_exact(&mut buf).await.unwrap();
            buf
        });

        // A dialer that sends a partial handshake and hangs up.
        let mut bad = TcpStream::connect(&addr).await.unwrap();
        bad.write_all(&[1u8; 10]).await.unwrap();
        drop(bad);

        let mut good = dial(&addr, "secret", Duration::from_secs(5)).await.unwrap();
        good.write_all(b"ok").await.unwrap();
        good.flush().await.unwrap();

        assert_eq!(&server.await.unwrap(), b"ok");
    }
}
