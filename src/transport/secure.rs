//! Stream-cipher secure channel
//!
//! Wraps any duplex byte stream. Every byte written is XORed with the write
//! keystream before it reaches the wire; every byte read is XORed with the
//! read keystream. There is no framing, padding or tag, so the channel is a
//! drop-in replacement for the stream it wraps.

use crate::crypto::{KeyStream, SessionKeys};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Upper bound on plaintext accepted by a single `poll_write`
const MAX_WRITE_CHUNK: usize = 64 * 1024;

/// An encrypted duplex connection
pub struct SecureChannel<S> {
    inner: S,
    reader: KeyStream,
    writer: KeyStream,
    /// Ciphertext already produced by the write keystream but not yet
    /// accepted by `inner`. Must reach the wire before any newer bytes.
    pending: Vec<u8>,
    pending_pos: usize,
    shutdown: bool,
}

impl<S> SecureChannel<S> {
    /// Wrap `inner` with keystreams derived from `keys`
    pub fn new(inner: S, keys: &SessionKeys) -> Self {
        let (reader, writer) = KeyStream::pair(keys);
        Self {
            inner,
            reader,
            writer,
            pending: Vec::new(),
            pending_pos: 0,
            shutdown: false,
        }
    }

    /// Get a reference to the wrapped stream
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Get a mutable reference to the wrapped stream.
    ///
    /// Reading or writing through it desynchronizes the keystreams.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl SecureChannel<TcpStream> {
    /// Remote address of the underlying socket
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// Local address of the underlying socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl<S: AsyncWrite + Unpin> SecureChannel<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SecureChannel<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.reader.apply(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SecureChannel<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.shutdown {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_WRITE_CHUNK);
        this.pending.extend_from_slice(&buf[..n]);
        this.writer.apply(&mut this.pending);

        // The keystream has advanced, so the bytes are ours now. Push what the
        // socket takes immediately and keep the rest for the next poll.
        match this.poll_drain(cx) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            _ => Poll::Ready(Ok(n)),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.shutdown {
            return Poll::Ready(Ok(()));
        }
        ready!(this.poll_drain(cx))?;
        ready!(Pin::new(&mut this.inner).poll_shutdown(cx))?;
        this.shutdown = true;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn keys(secret: &str) -> SessionKeys {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        SessionKeys::derive(secret, date, &[9u8; 1280]).unwrap()
    }

    #[tokio::test]
    async fn test_duplex_roundtrip() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = SecureChannel::new(a, &keys("secret"));
        let mut server = SecureChannel::new(b, &keys("secret"));

        client.write_all(b"ping from client").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 16];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping from client");

        server.write_all(b"pong").await.unwrap();
        server.flush().await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_ciphertext_same_length_and_not_plaintext() {
        let (a, mut raw) = tokio::io::duplex(1024);
        let mut client = SecureChannel::new(a, &keys("secret"));

        let message = b"attack at dawn, bring snacks";
        client.write_all(message).await.unwrap();
        client.flush().await.unwrap();
        drop(client);

        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire.len(), message.len());
        assert_ne!(&wire[..], &message[..]);
    }

    #[tokio::test]
    async fn test_large_write_through_small_pipe() {
        // The pipe holds far less than one write, so ciphertext must be
        // buffered across polls without reordering.
        let (a, b) = tokio::io::duplex(64);
        let mut client = SecureChannel::new(a, &keys("secret"));
        let mut server = SecureChannel::new(b, &keys("secret"));

        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        let expected = data.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&data).await.unwrap();
            client.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_wrong_secret_reads_garbage() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = SecureChannel::new(a, &keys("secret"));
        let mut server = SecureChannel::new(b, &keys("not the secret"));

        client.write_all(b"hello world, hello world").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 24];
        server.read_exact(&mut buf).await.unwrap();
        assert_ne!(&buf, b"hello world, hello world");
    }

    #[tokio::test]
    async fn test_shutdown_idempotent() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut client = SecureChannel::new(a, &keys("secret"));

        client.shutdown().await.unwrap();
        client.shutdown().await.unwrap();
        assert!(client.write_all(b"late").await.is_err());

        let mut buf = Vec::new();
        assert_eq!(b.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
