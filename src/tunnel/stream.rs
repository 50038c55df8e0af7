//! Multiplexed stream implementation

use super::session::{Command, WriterMsg};
use super::{Frame, SessionConfig, TunnelError};
use crate::proxy::AddrSpec;
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, error::SendError, OwnedPermit};
use tracing::trace;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is open and active
    Open,
    /// Local side has closed
    HalfClosedLocal,
    /// Remote side has closed
    HalfClosedRemote,
    /// Stream is fully closed
    Closed,
}

impl StreamState {
    /// Check if the remote may still send data
    pub fn can_recv(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Transition after the local side closed
    pub fn close_local(self) -> Self {
        match self {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        }
    }

    /// Transition after the remote side closed
    pub fn close_remote(self) -> Self {
        match self {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        }
    }
}

/// Event delivered from the session to one stream
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    /// The peer's answer to our open; 0 means the destination was reached
    Opened(u8),
    Close,
}

/// Send credit granted by the peer for one stream
#[derive(Debug)]
pub(crate) struct SendWindow {
    state: Mutex<WindowState>,
}

#[derive(Debug, Default)]
struct WindowState {
    credit: usize,
    closed: bool,
    waker: Option<Waker>,
}

impl SendWindow {
    pub(crate) fn new(credit: usize) -> Self {
        Self {
            state: Mutex::new(WindowState {
                credit,
                ..WindowState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add credit from a window update and wake a blocked writer
    pub(crate) fn grant(&self, increment: usize) {
        let waker = {
            let mut state = self.lock();
            state.credit = state.credit.saturating_add(increment);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Fail any writer waiting for credit
    pub(crate) fn close(&self) {
        let waker = {
            let mut state = self.lock();
            state.closed = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn poll_credit(&self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let mut state = self.lock();
        if state.closed {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed")));
        }
        if state.credit > 0 {
            return Poll::Ready(Ok(state.credit));
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn consume(&self, amount: usize) {
        let mut state = self.lock();
        state.credit = state.credit.saturating_sub(amount);
    }
}

type ReserveFuture =
    Pin<Box<dyn Future<Output = Result<OwnedPermit<WriterMsg>, SendError<()>>> + Send + Sync>>;

/// One logical connection inside a session.
///
/// Reads return EOF once the peer closes its side. If the session dies first,
/// reads fail with `ConnectionAborted` and writes with `BrokenPipe`. Writes
/// wait while the peer's receive window for this stream is exhausted; reading
/// hands window back to the peer.
pub struct MuxStream {
    id: u32,
    destination: Option<AddrSpec>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    read_buf: Bytes,
    read_closed: bool,
    /// Bytes read since the last window update we sent
    unacked: usize,
    receive_window: usize,
    send_window: Arc<SendWindow>,
    frame_tx: mpsc::Sender<WriterMsg>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    reserve: Option<ReserveFuture>,
    write_closed: bool,
    max_payload: usize,
}

impl MuxStream {
    pub(crate) fn new(
        id: u32,
        destination: Option<AddrSpec>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        send_window: Arc<SendWindow>,
        frame_tx: mpsc::Sender<WriterMsg>,
        cmd_tx: mpsc::UnboundedSender<Command>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            id,
            destination,
            events,
            read_buf: Bytes::new(),
            read_closed: false,
            unacked: 0,
            receive_window: config.receive_window(),
            send_window,
            frame_tx,
            cmd_tx,
            reserve: None,
            write_closed: false,
            max_payload: config.max_frame_size,
        }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Destination requested by the opener, if any
    pub fn destination(&self) -> Option<&AddrSpec> {
        self.destination.as_ref()
    }

    /// Wait for the peer to report whether it reached the destination.
    ///
    /// A status other than 0 is `TunnelError::OpenRefused` carrying the
    /// peer's SOCKS5 reply code.
    pub async fn wait_open(&mut self) -> Result<(), TunnelError> {
        match self.events.recv().await {
            Some(StreamEvent::Opened(0)) => Ok(()),
            Some(StreamEvent::Opened(status)) => {
                self.read_closed = true;
                Err(TunnelError::OpenRefused(status))
            }
            // Data before any result: the peer relays without reporting.
            Some(StreamEvent::Data(data)) => {
                self.read_buf = data;
                Ok(())
            }
            Some(StreamEvent::Close) => {
                self.read_closed = true;
                Err(TunnelError::StreamClosed)
            }
            None => Err(TunnelError::SessionClosed),
        }
    }

    /// Tell the opener its destination is connected
    pub async fn confirm_open(&self) -> Result<(), TunnelError> {
        self.send_open_result(0).await
    }

    /// Tell the opener its destination failed with `status`, then close
    pub async fn refuse_open(self, status: u8) -> Result<(), TunnelError> {
        self.send_open_result(status).await
    }

    async fn send_open_result(&self, status: u8) -> Result<(), TunnelError> {
        self.frame_tx
            .send(WriterMsg::Frame(Frame::open_result(self.id, status)))
            .await
            .map_err(|_| TunnelError::SessionClosed)
    }

    fn poll_reserve(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<OwnedPermit<WriterMsg>>> {
        let frame_tx = &self.frame_tx;
        let fut = self
            .reserve
            .get_or_insert_with(|| Box::pin(frame_tx.clone().reserve_owned()));
        let result = ready!(fut.as_mut().poll(cx));
        self.reserve = None;
        Poll::Ready(result.map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "session closed")))
    }

    /// Return window to the peer once half of it has been read
    fn release_window(&mut self, consumed: usize) {
        self.unacked += consumed;
        if self.read_closed || self.unacked < self.receive_window / 2 {
            return;
        }
        let increment = self.unacked as u32;
        self.unacked = 0;
        let _ = self.cmd_tx.send(Command::Grant {
            stream_id: self.id,
            increment,
        });
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let n = self.read_buf.len().min(buf.remaining());
                let chunk = self.read_buf.split_to(n);
                buf.put_slice(&chunk);
                self.release_window(n);
                return Poll::Ready(Ok(()));
            }
            if self.read_closed {
                return Poll::Ready(Ok(()));
            }
            match ready!(self.events.poll_recv(cx)) {
                Some(StreamEvent::Data(data)) => self.read_buf = data,
                Some(StreamEvent::Opened(0)) => {}
                Some(StreamEvent::Opened(status)) => {
                    self.read_closed = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("peer could not reach destination (status {})", status),
                    )));
                }
                Some(StreamEvent::Close) => self.read_closed = true,
                None => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "session closed",
                    )))
                }
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let credit = ready!(self.send_window.poll_credit(cx))?;
        let permit = ready!(self.poll_reserve(cx))?;
        let n = buf.len().min(self.max_payload).min(credit);
        self.send_window.consume(n);
        permit.send(WriterMsg::Frame(Frame::data(
            self.id,
            Bytes::copy_from_slice(&buf[..n]),
        )));
        Poll::Ready(Ok(n))
    }
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are already queued for the session writer in order.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.write_closed {
            return Poll::Ready(Ok(()));
        }
        let permit = ready!(self.poll_reserve(cx))?;
        permit.send(WriterMsg::Frame(Frame::stream_close(self.id)));
        self.write_closed = true;
        let _ = self.cmd_tx.send(Command::LocalClose { stream_id: self.id });
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !self.write_closed {
            let msg = WriterMsg::Frame(Frame::stream_close(self.id));
            if let Err(mpsc::error::TrySendError::Full(msg)) = self.frame_tx.try_send(msg) {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let frame_tx = self.frame_tx.clone();
                    handle.spawn(async move {
                        let _ = frame_tx.send(msg).await;
                    });
                }
            }
        }
        trace!("Stream {} released", self.id);
        let _ = self.cmd_tx.send(Command::Release { stream_id: self.id });
    }
}
