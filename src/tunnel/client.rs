//! Client-side session reuse
//!
//! The first stream dials the server and starts a session; later streams
//! reuse it. A dead session is dropped and the next open re-handshakes.

use super::{BoxedStream, MuxStream, Multiplexer, Session, SessionConfig, TunnelError};
use crate::proxy::AddrSpec;
use crate::transport::dial;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Lazily established, shared session to one tunnel server
pub struct SessionClient {
    server: String,
    secret: String,
    connect_timeout: Duration,
    config: SessionConfig,
    session: Mutex<Option<Session>>,
    handshakes: AtomicUsize,
}

impl SessionClient {
    pub fn new(
        server: impl Into<String>,
        secret: impl Into<String>,
        connect_timeout: Duration,
        config: SessionConfig,
    ) -> Self {
        Self {
            server: server.into(),
            secret: secret.into(),
            connect_timeout,
            config,
            session: Mutex::new(None),
            handshakes: AtomicUsize::new(0),
        }
    }

    /// Number of secure channels established so far
    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::Relaxed)
    }

    /// Current live session, dialing a new one if needed.
    ///
    /// The lock is held across the dial so concurrent first callers share
    /// one handshake.
    async fn session(&self) -> Result<Session, TunnelError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if !session.is_closed() {
                return Ok(session.clone());
            }
            debug!("Session to {} is closed, reconnecting", self.server);
        }

        let channel = dial(&self.server, &self.secret, self.connect_timeout).await?;
        let count = self.handshakes.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Session to {} established (handshake #{})", self.server, count);

        // The server never opens streams toward the client.
        let (session, _incoming) = Session::client(channel, self.config.clone());
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Open a stream on the shared session
    pub async fn open_stream(&self, destination: Option<AddrSpec>) -> Result<MuxStream, TunnelError> {
        let session = self.session().await?;
        match session.open_stream(destination).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                warn!("Stream open failed, dropping session: {}", e);
                let mut guard = self.session.lock().await;
                if guard.as_ref().is_some_and(|current| current.same_session(&session)) {
                    if let Some(dead) = guard.take() {
                        dead.close();
                    }
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Multiplexer for SessionClient {
    async fn open(&self, destination: Option<AddrSpec>) -> Result<BoxedStream, TunnelError> {
        let wait = destination.is_some();
        let mut stream = self.open_stream(destination).await?;
        if wait {
            stream.wait_open().await?;
        }
        Ok(Box::new(stream))
    }
}
