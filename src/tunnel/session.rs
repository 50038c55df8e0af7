//! Direct multiplexing session
//!
//! A session owns one secure channel and carries many streams over it. Two
//! tasks run per session:
//!
//! - the driver reads frames, owns the stream registry and runs keepalive
//! - the writer serializes outbound frames onto the channel
//!
//! Streams queue their data frames straight to the writer, so a busy stream
//! never has to wait on the driver. The driver itself never waits on anything
//! but the socket: session frames go out through an unbounded control queue
//! the writer drains first, and inbound data is bounded by per-stream credit
//! (window updates), so handing it to a stream never blocks. A stream whose
//! reader stalls only stops its own sender.

use super::stream::{MuxStream, SendWindow, StreamEvent, StreamState};
use super::{Frame, FrameType, SessionConfig, TunnelError, MAX_STREAMS};
use crate::protocol::INITIAL_WINDOW;
use crate::proxy::AddrSpec;
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Outbound data frame queue depth
const WRITER_QUEUE: usize = 256;

/// Pending inbound streams not yet accepted
const ACCEPT_BACKLOG: usize = 128;

/// How long a graceful close waits for queued frames to drain
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Message for the session writer task
#[derive(Debug)]
pub(crate) enum WriterMsg {
    Frame(Frame),
    Shutdown,
}

/// Registry operation sent to the driver
pub(crate) enum Command {
    Open {
        destination: Option<AddrSpec>,
        reply: oneshot::Sender<Result<MuxStream, TunnelError>>,
    },
    /// The stream's reader consumed `increment` bytes
    Grant {
        stream_id: u32,
        increment: u32,
    },
    LocalClose {
        stream_id: u32,
    },
    Release {
        stream_id: u32,
    },
    Shutdown,
}

/// Handle to a running session
#[derive(Clone)]
pub struct Session {
    cmd_tx: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
}

/// Streams opened by the remote side
pub struct Incoming {
    rx: mpsc::Receiver<MuxStream>,
}

impl Incoming {
    /// Wait for the next remote-opened stream. `None` once the session ends.
    pub async fn accept(&mut self) -> Option<MuxStream> {
        self.rx.recv().await
    }
}

impl Session {
    /// Start the client side of a session (odd stream IDs)
    pub fn client<S>(channel: S, config: SessionConfig) -> (Session, Incoming)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn(channel, config, true)
    }

    /// Start the server side of a session (even stream IDs)
    pub fn server<S>(channel: S, config: SessionConfig) -> (Session, Incoming)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn(channel, config, false)
    }

    fn spawn<S>(channel: S, config: SessionConfig, is_client: bool) -> (Session, Incoming)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(channel);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(WRITER_QUEUE);
        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(write_loop(writer, control_rx, frame_rx));

        let driver = Driver {
            reader,
            read_buf: BytesMut::with_capacity(config.max_frame_size * 2),
            streams: HashMap::new(),
            next_stream_id: if is_client { 1 } else { 2 },
            is_client,
            cmd_rx,
            cmd_tx: cmd_tx.downgrade(),
            control_tx,
            frame_tx,
            incoming_tx,
            config,
            last_seen: Instant::now(),
            ping_nonce: 0,
            closed: Arc::clone(&closed),
        };
        tokio::spawn(driver.run(writer));

        (Session { cmd_tx, closed }, Incoming { rx: incoming_rx })
    }

    /// Open a new stream. `destination` travels in the open frame; `None`
    /// asks the peer to use its default forward target.
    pub async fn open_stream(&self, destination: Option<AddrSpec>) -> Result<MuxStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Open { destination, reply })
            .map_err(|_| TunnelError::SessionClosed)?;
        let stream = reply_rx.await.map_err(|_| TunnelError::SessionClosed)??;

        debug!("Opened stream {}", stream.id());
        Ok(stream)
    }

    /// Whether the session has stopped
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the session. Open streams fail.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    /// Whether two handles refer to the same session
    pub fn same_session(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.closed, &other.closed)
    }
}

struct StreamEntry {
    state: StreamState,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    /// Bytes the peer may still send before we grant more
    recv_window: usize,
    send_window: Arc<SendWindow>,
}

enum DriverEvent {
    Read(std::io::Result<usize>),
    Command(Option<Command>),
    Keepalive,
    WriterDone,
}

struct Driver<S> {
    reader: ReadHalf<S>,
    read_buf: BytesMut,
    streams: HashMap<u32, StreamEntry>,
    next_stream_id: u32,
    is_client: bool,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    cmd_tx: mpsc::WeakUnboundedSender<Command>,
    /// Session frames; written ahead of stream data
    control_tx: mpsc::UnboundedSender<Frame>,
    frame_tx: mpsc::Sender<WriterMsg>,
    incoming_tx: mpsc::Sender<MuxStream>,
    config: SessionConfig,
    last_seen: Instant,
    ping_nonce: u64,
    closed: Arc<AtomicBool>,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> Driver<S> {
    async fn run(mut self, mut writer: JoinHandle<Result<(), TunnelError>>) {
        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.tick().await;

        let mut writer_done = false;
        let result = loop {
            let event = tokio::select! {
                read = self.reader.read_buf(&mut self.read_buf) => DriverEvent::Read(read),
                cmd = self.cmd_rx.recv() => DriverEvent::Command(cmd),
                _ = keepalive.tick() => DriverEvent::Keepalive,
                _ = &mut writer => DriverEvent::WriterDone,
            };

            match event {
                DriverEvent::Read(Ok(0)) => break Err(TunnelError::SessionClosed),
                DriverEvent::Read(Ok(_)) => {
                    self.last_seen = Instant::now();
                    if let Err(e) = self.process_frames() {
                        break Err(e);
                    }
                }
                DriverEvent::Read(Err(e)) => break Err(e.into()),
                DriverEvent::Command(None) | DriverEvent::Command(Some(Command::Shutdown)) => {
                    break Ok(())
                }
                DriverEvent::Command(Some(cmd)) => self.handle_command(cmd),
                DriverEvent::Keepalive => {
                    if self.last_seen.elapsed() > self.config.keepalive_timeout {
                        break Err(TunnelError::KeepaliveTimeout);
                    }
                    self.ping_nonce = self.ping_nonce.wrapping_add(1);
                    self.send_control(Frame::ping(self.ping_nonce));
                }
                DriverEvent::WriterDone => {
                    writer_done = true;
                    break Err(TunnelError::SessionClosed);
                }
            }
        };

        self.closed.store(true, Ordering::Release);
        for entry in self.streams.values() {
            entry.send_window.close();
        }
        match result {
            Ok(()) => {
                debug!("Session closing, {} stream(s) open", self.streams.len());
                if !writer_done {
                    self.send_control(Frame::go_away());
                    let frame_tx = self.frame_tx.clone();
                    let drained = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, async {
                        // Shutdown queues behind data already accepted from streams.
                        let _ = frame_tx.send(WriterMsg::Shutdown).await;
                        let _ = (&mut writer).await;
                    })
                    .await;
                    if drained.is_err() {
                        writer.abort();
                    }
                }
            }
            Err(e) => {
                warn!("Session failed: {}", e);
                writer.abort();
            }
        }
        // Dropping the registry ends every stream's event channel.
        self.streams.clear();
    }

    fn send_control(&self, frame: Frame) {
        let _ = self.control_tx.send(frame);
    }

    fn process_frames(&mut self) -> Result<(), TunnelError> {
        while let Some(frame) = Frame::decode(&mut self.read_buf, self.config.max_frame_size)? {
            self.handle_frame(frame)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), TunnelError> {
        trace!(
            "Frame {:?} stream={} len={}",
            frame.frame_type,
            frame.stream_id,
            frame.payload.len()
        );
        match frame.frame_type {
            FrameType::Data => {
                let Some(entry) = self.streams.get_mut(&frame.stream_id) else {
                    trace!("Data for unknown stream {}", frame.stream_id);
                    return Ok(());
                };
                if !entry.state.can_recv() {
                    return Ok(());
                }
                if frame.payload.len() > entry.recv_window {
                    return Err(TunnelError::FlowControl);
                }
                entry.recv_window -= frame.payload.len();
                let _ = entry.event_tx.send(StreamEvent::Data(frame.payload));
            }
            FrameType::StreamOpen => self.handle_stream_open(frame)?,
            FrameType::StreamClose => {
                if let Some(entry) = self.streams.get_mut(&frame.stream_id) {
                    entry.state = entry.state.close_remote();
                    let _ = entry.event_tx.send(StreamEvent::Close);
                    if entry.state == StreamState::Closed {
                        self.streams.remove(&frame.stream_id);
                    }
                }
            }
            FrameType::WindowUpdate => {
                let increment = <[u8; 4]>::try_from(&frame.payload[..])
                    .map_err(|_| TunnelError::InvalidFrame("bad window update".into()))?;
                if let Some(entry) = self.streams.get(&frame.stream_id) {
                    entry.send_window.grant(u32::from_be_bytes(increment) as usize);
                }
            }
            FrameType::OpenResult => {
                let &[status] = &frame.payload[..] else {
                    return Err(TunnelError::InvalidFrame("bad open result".into()));
                };
                if let Some(entry) = self.streams.get(&frame.stream_id) {
                    let _ = entry.event_tx.send(StreamEvent::Opened(status));
                }
            }
            FrameType::Ping => self.send_control(Frame::pong(frame.payload)),
            FrameType::Pong => {}
            FrameType::GoAway => {
                debug!("Peer sent go-away");
                return Err(TunnelError::SessionClosed);
            }
        }
        Ok(())
    }

    fn handle_stream_open(&mut self, frame: Frame) -> Result<(), TunnelError> {
        let id = frame.stream_id;
        // Remote-opened IDs have the opposite parity of ours.
        let remote_is_client = id % 2 == 1;
        if id == 0 || remote_is_client == self.is_client {
            return Err(TunnelError::InvalidFrame(format!("bad stream id {} in open", id)));
        }
        if self.streams.contains_key(&id) {
            return Err(TunnelError::InvalidFrame(format!("stream {} already open", id)));
        }

        let destination = if frame.payload.is_empty() {
            None
        } else {
            Some(
                AddrSpec::from_bytes(&frame.payload)
                    .map_err(|e| TunnelError::InvalidFrame(format!("bad destination: {}", e)))?,
            )
        };

        let Some(stream) = self.register(id, destination) else {
            return Err(TunnelError::SessionClosed);
        };
        debug!("Peer opened stream {}", id);

        if self.incoming_tx.try_send(stream).is_err() {
            // Backlog full or nobody accepting; dropping the stream closes it.
            debug!("Rejecting stream {}: not accepting", id);
        }
        Ok(())
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Open { destination, reply } => {
                let result = self.open_local(destination);
                let _ = reply.send(result);
            }
            Command::Grant {
                stream_id,
                increment,
            } => {
                if let Some(entry) = self.streams.get_mut(&stream_id) {
                    entry.recv_window = entry.recv_window.saturating_add(increment as usize);
                    self.send_control(Frame::window_update(stream_id, increment));
                }
            }
            Command::LocalClose { stream_id } => {
                if let Some(entry) = self.streams.get_mut(&stream_id) {
                    entry.state = entry.state.close_local();
                    if entry.state == StreamState::Closed {
                        self.streams.remove(&stream_id);
                    }
                }
            }
            Command::Release { stream_id } => {
                self.streams.remove(&stream_id);
            }
            Command::Shutdown => {}
        }
    }

    fn open_local(&mut self, destination: Option<AddrSpec>) -> Result<MuxStream, TunnelError> {
        if self.streams.len() >= MAX_STREAMS {
            return Err(TunnelError::TooManyStreams);
        }
        let payload = destination.as_ref().map(AddrSpec::to_bytes).unwrap_or_default();
        let id = self.next_stream_id;
        self.next_stream_id = id.checked_add(2).ok_or(TunnelError::TooManyStreams)?;
        // The open goes on the control queue ahead of the window grant
        // `register` sends, so the peer knows the stream first.
        self.send_control(Frame::stream_open(id, &payload));
        self.register(id, destination).ok_or(TunnelError::SessionClosed)
    }

    /// Add a stream to the registry. Both ends start with `INITIAL_WINDOW`
    /// of credit; a larger configured window is granted right away.
    fn register(&mut self, id: u32, destination: Option<AddrSpec>) -> Option<MuxStream> {
        let cmd_tx = self.cmd_tx.upgrade()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let send_window = Arc::new(SendWindow::new(INITIAL_WINDOW));
        let window = self.config.receive_window();
        self.streams.insert(
            id,
            StreamEntry {
                state: StreamState::Open,
                event_tx,
                recv_window: window,
                send_window: Arc::clone(&send_window),
            },
        );
        if window > INITIAL_WINDOW {
            self.send_control(Frame::window_update(id, (window - INITIAL_WINDOW) as u32));
        }
        Some(MuxStream::new(
            id,
            destination,
            event_rx,
            send_window,
            self.frame_tx.clone(),
            cmd_tx,
            &self.config,
        ))
    }
}

/// Write frames until shutdown. Control frames always go first; whatever is
/// already queued is batched before each flush.
async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut control_rx: mpsc::UnboundedReceiver<Frame>,
    mut frame_rx: mpsc::Receiver<WriterMsg>,
) -> Result<(), TunnelError>
where
    S: AsyncWrite,
{
    loop {
        let msg = tokio::select! {
            biased;
            Some(frame) = control_rx.recv() => WriterMsg::Frame(frame),
            msg = frame_rx.recv() => match msg {
                Some(msg) => msg,
                None => return Ok(()),
            },
        };
        let mut next = Some(msg);
        while let Some(msg) = next.take() {
            match msg {
                WriterMsg::Frame(frame) => writer.write_all(&frame.encode()).await?,
                WriterMsg::Shutdown => {
                    while let Ok(frame) = control_rx.try_recv() {
                        writer.write_all(&frame.encode()).await?;
                    }
                    writer.flush().await?;
                    writer.shutdown().await?;
                    return Ok(());
                }
            }
            next = control_rx
                .try_recv()
                .map(WriterMsg::Frame)
                .or_else(|_| frame_rx.try_recv())
                .ok();
        }
        writer.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair(config: SessionConfig) -> ((Session, Incoming), (Session, Incoming)) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Session::client(a, config.clone()), Session::server(b, config))
    }

    #[tokio::test]
    async fn test_open_and_echo() {
        let ((client, _), (_server, mut incoming)) = pair(SessionConfig::default());

        tokio::spawn(async move {
            while let Some(stream) = incoming.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = tokio::io::split(stream);
                    tokio::io::copy(&mut r, &mut w).await.unwrap();
                });
            }
        });

        let mut stream = client.open_stream(None).await.unwrap();
        assert_eq!(stream.id(), 1);
        stream.write_all(b"echo me").await.unwrap();
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo me");
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let ((client, _), (_server, mut incoming)) = pair(SessionConfig::default());

        let mut s1 = client.open_stream(None).await.unwrap();
        let mut s2 = client.open_stream(None).await.unwrap();
        assert_eq!((s1.id(), s2.id()), (1, 3));

        let mut r1 = incoming.accept().await.unwrap();
        let mut r2 = incoming.accept().await.unwrap();

        s2.write_all(b"second").await.unwrap();
        s1.write_all(b"first").await.unwrap();
        s1.shutdown().await.unwrap();
        s2.shutdown().await.unwrap();

        let mut out1 = Vec::new();
        let mut out2 = Vec::new();
        r1.read_to_end(&mut out1).await.unwrap();
        r2.read_to_end(&mut out2).await.unwrap();
        assert_eq!(out1, b"first");
        assert_eq!(out2, b"second");
    }

    #[tokio::test]
    async fn test_destination_travels_with_open() {
        let ((client, _), (_server, mut incoming)) = pair(SessionConfig::default());

        let dest = AddrSpec::from(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 8080)));
        let _stream = client.open_stream(Some(dest.clone())).await.unwrap();
        let remote = incoming.accept().await.unwrap();
        assert_eq!(remote.destination(), Some(&dest));

        let _plain = client.open_stream(None).await.unwrap();
        let remote = incoming.accept().await.unwrap();
        assert!(remote.destination().is_none());
    }

    #[tokio::test]
    async fn test_session_failure_closes_streams() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (client, _incoming) = Session::client(a, SessionConfig::default());

        let mut stream = client.open_stream(None).await.unwrap();
        drop(b);

        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(client.is_closed());
        assert!(matches!(
            client.open_stream(None).await,
            Err(TunnelError::SessionClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_timeout() {
        // The peer end of the pipe is never read or written.
        let (a, _b) = tokio::io::duplex(64 * 1024);
        let config = SessionConfig {
            keepalive_interval: Duration::from_secs(1),
            keepalive_timeout: Duration::from_secs(3),
            ..SessionConfig::default()
        };
        let (client, _incoming) = Session::client(a, config);
        assert!(!client.is_closed());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(client.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_keeps_idle_session_up() {
        let config = SessionConfig {
            keepalive_interval: Duration::from_secs(1),
            keepalive_timeout: Duration::from_secs(3),
            ..SessionConfig::default()
        };
        let ((client, _), (server, _)) = pair(config);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!client.is_closed());
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn test_close_sends_go_away() {
        let ((client, _), (server, _)) = pair(SessionConfig::default());
        client.close();

        for _ in 0..50 {
            if server.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.is_closed());
        assert!(server.is_closed());
    }

    fn tight_config() -> SessionConfig {
        SessionConfig {
            keepalive_interval: Duration::from_secs(1),
            keepalive_timeout: Duration::from_secs(3),
            receive_buffer: INITIAL_WINDOW,
            ..SessionConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stream_does_not_block_siblings() {
        let ((client, _), (server, mut incoming)) = pair(tight_config());

        let mut stalled = client.open_stream(None).await.unwrap();
        let mut healthy = client.open_stream(None).await.unwrap();
        let mut flooded = incoming.accept().await.unwrap();
        let mut answering = incoming.accept().await.unwrap();

        // Nobody reads `stalled` while the server pushes far past its window.
        let flood = tokio::spawn(async move {
            flooded.write_all(&vec![7u8; 1024 * 1024]).await.unwrap();
            flooded
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        answering.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        tokio::time::timeout(Duration::from_secs(2), healthy.read_exact(&mut buf))
            .await
            .expect("sibling stream starved")
            .unwrap();
        assert_eq!(&buf, b"hi");

        let opened = tokio::time::timeout(Duration::from_secs(2), client.open_stream(None)).await;
        assert_eq!(opened.expect("open hung").unwrap().id(), 5);

        // Well past the keepalive timeout, pings still flow both ways.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!client.is_closed());
        assert!(!server.is_closed());
        assert!(!flood.is_finished());

        // Draining the stalled stream lets the sender finish.
        let mut received = vec![0u8; 1024 * 1024];
        stalled.read_exact(&mut received).await.unwrap();
        assert!(received.iter().all(|&b| b == 7));
        flood.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_window_bounds_unread_data() {
        let ((client, _), (_server, mut incoming)) = pair(tight_config());

        let mut reader = client.open_stream(None).await.unwrap();
        let mut writer = incoming.accept().await.unwrap();

        let chunk = vec![1u8; 4096];
        let mut accepted = 0;
        while let Ok(written) =
            tokio::time::timeout(Duration::from_millis(200), writer.write(&chunk)).await
        {
            accepted += written.unwrap();
            assert!(accepted <= INITIAL_WINDOW, "sender ran past the receive window");
        }
        assert_eq!(accepted, INITIAL_WINDOW);

        // Reading half the window hands it back to the sender.
        let mut half = vec![0u8; INITIAL_WINDOW / 2];
        reader.read_exact(&mut half).await.unwrap();
        let resumed = tokio::time::timeout(Duration::from_secs(1), writer.write(&chunk))
            .await
            .expect("window was not returned")
            .unwrap();
        assert_eq!(resumed, 4096);
    }

    #[tokio::test]
    async fn test_window_overrun_fails_session() {
        let (a, mut b) = tokio::io::duplex(256 * 1024);
        let config = SessionConfig {
            receive_buffer: INITIAL_WINDOW,
            ..SessionConfig::default()
        };
        let (client, mut incoming) = Session::client(a, config);

        b.write_all(&Frame::stream_open(2, b"").encode()).await.unwrap();
        let _stream = incoming.accept().await.unwrap();
        for _ in 0..3 {
            let frame = Frame::data(2, bytes::Bytes::from(vec![0u8; 32768]));
            b.write_all(&frame.encode()).await.unwrap();
        }

        for _ in 0..50 {
            if client.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_open_result_reaches_opener() {
        let ((client, _), (_server, mut incoming)) = pair(SessionConfig::default());

        let mut accepted = client.open_stream(None).await.unwrap();
        incoming.accept().await.unwrap().confirm_open().await.unwrap();
        accepted.wait_open().await.unwrap();

        let mut refused = client.open_stream(None).await.unwrap();
        incoming.accept().await.unwrap().refuse_open(5).await.unwrap();
        assert!(matches!(
            refused.wait_open().await,
            Err(TunnelError::OpenRefused(5))
        ));
    }
}
