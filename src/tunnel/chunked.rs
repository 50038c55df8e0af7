//! Chunked streaming backend
//!
//! One secure channel per external connection, carrying discrete payload
//! messages instead of multiplexed frames:
//!
//! ```text
//! +--------+--------+--------+--------+--------+---------
//! |  Flag  |          Length (4B)              |  Data ...
//! +--------+--------+--------+--------+--------+---------
//! ```
//!
//! `Load` messages carry forwarded bytes. Every `Load` received is answered
//! with an `Ack` holding a few random filler bytes, and a sender keeps at
//! most [`ACK_WINDOW`] loads unacknowledged.

use super::{BoxedStream, Multiplexer, TunnelError};
use crate::crypto::{random_bytes, random_len};
use crate::proxy::AddrSpec;
use crate::transport::dial;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, trace};

/// Payload header size in bytes
pub const PAYLOAD_HEADER_SIZE: usize = 5;

/// Largest data carried by one `Load`
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Largest payload accepted from the peer
const MAX_PAYLOAD: usize = 64 * 1024;

/// Unacknowledged loads allowed in flight
pub const ACK_WINDOW: usize = 64;

/// Largest random filler carried by an `Ack`
const MAX_ACK_FILLER: u8 = 16;

/// Payload flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flag {
    Load = 0,
    Ack = 1,
}

impl TryFrom<u8> for Flag {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Flag::Load),
            1 => Ok(Flag::Ack),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown payload flag: {}",
                value
            ))),
        }
    }
}

/// One chunked-streaming message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub data: Bytes,
    pub flag: Flag,
}

impl Payload {
    pub fn load(data: Bytes) -> Self {
        Self {
            data,
            flag: Flag::Load,
        }
    }

    /// An ack padded with 1 to 16 random bytes
    pub fn ack() -> Result<Self, TunnelError> {
        let mut filler = vec![0u8; random_len(MAX_ACK_FILLER)?];
        random_bytes(&mut filler)?;
        Ok(Self {
            data: Bytes::from(filler),
            flag: Flag::Ack,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(PAYLOAD_HEADER_SIZE + self.data.len());
        buf.put_u8(self.flag as u8);
        buf.put_u32(self.data.len() as u32);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode one payload; `Ok(None)` when more bytes are needed
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        if buf.len() < PAYLOAD_HEADER_SIZE {
            return Ok(None);
        }
        let flag = Flag::try_from(buf[0])?;
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(TunnelError::FrameTooLarge(len, MAX_PAYLOAD));
        }
        if buf.len() < PAYLOAD_HEADER_SIZE + len {
            return Ok(None);
        }
        buf.advance(PAYLOAD_HEADER_SIZE);
        let data = buf.split_to(len).freeze();
        Ok(Some(Self { data, flag }))
    }
}

/// Run the chunked protocol over `channel` and return the plaintext end.
///
/// Two tasks pump the channel: the uplink turns local writes into loads and
/// sends acks, the downlink delivers loads and releases window on acks. When
/// either side ends, both are torn down and the returned stream reads EOF.
pub fn spawn_chunked<S>(channel: S) -> DuplexStream
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (local, inner) = tokio::io::duplex(CHUNK_SIZE * 4);
    let (inner_rd, inner_wr) = tokio::io::split(inner);
    let (chan_rd, chan_wr) = tokio::io::split(channel);
    let window = Arc::new(Semaphore::new(ACK_WINDOW));
    let (ack_tx, ack_rx) = mpsc::unbounded_channel();

    let down_task = tokio::spawn({
        let window = Arc::clone(&window);
        async move {
            if let Err(e) = downlink(chan_rd, inner_wr, window, ack_tx).await {
                trace!("Chunked downlink ended: {}", e);
            }
        }
    });

    tokio::spawn(async move {
        if let Err(e) = uplink(inner_rd, chan_wr, window, ack_rx).await {
            trace!("Chunked uplink ended: {}", e);
        }
        down_task.abort();
    });

    local
}

async fn downlink<R, W>(
    mut chan: R,
    mut local: W,
    window: Arc<Semaphore>,
    ack_tx: mpsc::UnboundedSender<()>,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(MAX_PAYLOAD);
    loop {
        if chan.read_buf(&mut buf).await? == 0 {
            local.shutdown().await.ok();
            return Ok(());
        }
        while let Some(payload) = Payload::decode(&mut buf)? {
            match payload.flag {
                Flag::Load => {
                    local.write_all(&payload.data).await?;
                    if ack_tx.send(()).is_err() {
                        return Ok(());
                    }
                }
                Flag::Ack => window.add_permits(1),
            }
        }
    }
}

async fn uplink<R, W>(
    mut local: R,
    mut chan: W,
    window: Arc<Semaphore>,
    mut ack_rx: mpsc::UnboundedReceiver<()>,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut credit = None;
    loop {
        if credit.is_none() {
            // Keep acking while waiting for window, or the peer stalls too.
            tokio::select! {
                permit = Arc::clone(&window).acquire_owned() => {
                    credit = Some(permit.map_err(|_| TunnelError::SessionClosed)?);
                }
                ack = ack_rx.recv() => match ack {
                    Some(()) => send_payload(&mut chan, &Payload::ack()?).await?,
                    None => break,
                },
            }
            continue;
        }

        tokio::select! {
            ack = ack_rx.recv() => match ack {
                Some(()) => send_payload(&mut chan, &Payload::ack()?).await?,
                None => break,
            },
            read = local.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                if let Some(permit) = credit.take() {
                    permit.forget();
                }
                send_payload(&mut chan, &Payload::load(Bytes::copy_from_slice(&buf[..n]))).await?;
            }
        }
    }
    chan.shutdown().await.ok();
    Ok(())
}

async fn send_payload<W: AsyncWrite + Unpin>(chan: &mut W, payload: &Payload) -> Result<(), TunnelError> {
    chan.write_all(&payload.encode()).await?;
    chan.flush().await?;
    Ok(())
}

/// Dials one secure channel per stream
pub struct ChunkedDialer {
    server: String,
    secret: String,
    connect_timeout: Duration,
    handshakes: AtomicUsize,
}

impl ChunkedDialer {
    pub fn new(server: impl Into<String>, secret: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            server: server.into(),
            secret: secret.into(),
            connect_timeout,
            handshakes: AtomicUsize::new(0),
        }
    }

    /// Number of secure channels established so far
    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Multiplexer for ChunkedDialer {
    async fn open(&self, destination: Option<AddrSpec>) -> Result<BoxedStream, TunnelError> {
        if let Some(dest) = destination {
            return Err(TunnelError::Unsupported(format!(
                "chunked backend cannot carry destination {}",
                dest
            )));
        }
        let channel = dial(&self.server, &self.secret, self.connect_timeout).await?;
        self.handshakes.fetch_add(1, Ordering::Relaxed);
        debug!("Chunked channel to {} established", self.server);
        Ok(Box::new(spawn_chunked(channel)))
    }
}
