//! Relay engine
//!
//! Pairs two duplex endpoints and copies bytes both ways until either
//! direction terminates. The first direction to finish wins: the sibling copy
//! is cancelled and both endpoints are dropped, so a closed source always
//! shows up as a close on the far side.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::protocol::COPY_BUFFER_SIZE;

/// Relay errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Forward target {0} loops back to the tunnel")]
    LoopDetected(SocketAddr),

    #[error("Relay task ended without a result")]
    TaskLost,
}

/// Relay tuning
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Copy buffer per direction
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: COPY_BUFFER_SIZE,
        }
    }
}

/// Copy direction within a relay pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    AToB,
    BToA,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::AToB => write!(f, "a->b"),
            Direction::BToA => write!(f, "b->a"),
        }
    }
}

/// Byte counts of a finished relay pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub first_done: Direction,
}

impl fmt::Display for RelayStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes a->b, {} bytes b->a, {} ended first",
            self.a_to_b, self.b_to_a, self.first_done
        )
    }
}

/// Addresses of the tunnel connection a forward dial belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelAddrs {
    pub peer: SocketAddr,
    pub local: SocketAddr,
}

/// Reject a forward target that is the tunnel itself
pub fn check_loop(tunnel: &TunnelAddrs, target: SocketAddr) -> Result<(), RelayError> {
    if target == tunnel.peer || target == tunnel.local {
        warn!(
            "Forward target {} is the tunnel itself (peer {}, local {}); check the forward address",
            target, tunnel.peer, tunnel.local
        );
        return Err(RelayError::LoopDetected(target));
    }
    Ok(())
}

/// Relay between two endpoints until one direction ends.
///
/// Returns the stats when the first direction reached EOF, or the error that
/// ended it.
pub async fn relay<A, B>(a: A, b: B, config: &RelayConfig) -> Result<RelayStats, RelayError>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_rd, a_wr) = tokio::io::split(a);
    let (b_rd, b_wr) = tokio::io::split(b);
    let a_to_b = Arc::new(AtomicU64::new(0));
    let b_to_a = Arc::new(AtomicU64::new(0));
    let buffer_size = config.buffer_size.max(1);

    let (done_tx, mut done_rx) = mpsc::channel(2);
    let forward = tokio::spawn(copy_half(
        a_rd,
        b_wr,
        buffer_size,
        Arc::clone(&a_to_b),
        Direction::AToB,
        done_tx.clone(),
    ));
    let backward = tokio::spawn(copy_half(
        b_rd,
        a_wr,
        buffer_size,
        Arc::clone(&b_to_a),
        Direction::BToA,
        done_tx,
    ));

    let first = done_rx.recv().await;

    // Cancelling drops the sibling's halves, which closes both endpoints.
    forward.abort();
    backward.abort();
    let _ = forward.await;
    let _ = backward.await;

    let (first_done, result) = first.ok_or(RelayError::TaskLost)?;
    result?;
    Ok(RelayStats {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
        first_done,
    })
}

/// Check the forward connection for a loop, then relay it with the tunnel side.
///
/// On a loop both ends are dropped before any byte moves.
pub async fn relay_to_target<T>(
    tunnel: T,
    addrs: &TunnelAddrs,
    target: TcpStream,
    config: &RelayConfig,
) -> Result<RelayStats, RelayError>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    check_loop(addrs, target.peer_addr()?)?;
    relay(tunnel, target, config).await
}

async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    counter: Arc<AtomicU64>,
    direction: Direction,
    done: mpsc::Sender<(Direction, io::Result<()>)>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = copy_until_eof(&mut reader, &mut writer, buffer_size, &counter).await;
    trace!("Relay {} finished: {:?}", direction, result);
    let _ = done.send((direction, result)).await;
}

async fn copy_until_eof<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    counter: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
