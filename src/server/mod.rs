//! Tunnel server
//!
//! Accepts tunnel connections, completes the handshake on a per-connection
//! task, and forwards every stream the client opens to its destination or
//! to the configured forward target.

use crate::protocol::accept_backoff;
use crate::proxy::{connect_error, AddrSpec, Reply};
use crate::relay::{check_loop, relay, relay_to_target, RelayConfig, TunnelAddrs};
use crate::transport::{connect, PendingHandshake, SecureListener, TransportError};
use crate::tunnel::{spawn_chunked, Backend, MuxStream, Session, SessionConfig};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

/// Runtime settings for a tunnel server
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: String,
    /// Default forward target for streams that carry no destination
    pub forward: Option<String>,
    pub secret: String,
    pub backend: Backend,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub session: SessionConfig,
    pub relay: RelayConfig,
}

/// Tunnel server bound to its listen address
pub struct TunnelServer {
    listener: SecureListener,
    settings: Arc<ServerSettings>,
}

impl TunnelServer {
    /// Bind the tunnel listener
    pub async fn bind(settings: ServerSettings) -> Result<Self> {
        let listener =
            SecureListener::bind(&settings.listen, &settings.secret, settings.handshake_timeout)
                .await?;
        match &settings.forward {
            Some(target) => info!("Default forward target: {}", target),
            None => info!("No default forward target, streams must name a destination"),
        }
        Ok(Self {
            listener,
            settings: Arc::new(settings),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept tunnel connections until the listener fails
    pub async fn run(&self) -> Result<()> {
        let mut failures = 0u32;
        loop {
            let pending = match self.listener.accept().await {
                Ok(pending) => {
                    failures = 0;
                    pending
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let pause = accept_backoff(failures);
                    error!("Accept error: {} (retrying in {:?})", e, pause);
                    tokio::time::sleep(pause).await;
                    continue;
                }
            };

            let settings = Arc::clone(&self.settings);
            tokio::spawn(async move {
                let peer_addr = pending.peer_addr();
                if let Err(e) = handle_connection(pending, settings).await {
                    warn!("Tunnel connection from {} failed: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_connection(pending: PendingHandshake, settings: Arc<ServerSettings>) -> Result<()> {
    let peer_addr = pending.peer_addr();
    let channel = pending.complete().await?;
    let addrs = TunnelAddrs {
        peer: channel.peer_addr().map_err(TransportError::Io)?,
        local: channel.local_addr().map_err(TransportError::Io)?,
    };
    debug!("Secure channel with {} established", peer_addr);

    match settings.backend {
        Backend::Direct => {
            serve_session(channel, addrs, settings).await;
            Ok(())
        }
        Backend::Chunked => {
            let stream = spawn_chunked(channel);
            forward_stream(stream, addrs, &settings).await
        }
    }
}

async fn serve_session<S>(channel: S, addrs: TunnelAddrs, settings: Arc<ServerSettings>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (session, mut incoming) = Session::server(channel, settings.session.clone());

    while let Some(stream) = incoming.accept().await {
        let settings = Arc::clone(&settings);
        tokio::spawn(async move {
            let id = stream.id();
            if let Err(e) = forward_mux_stream(stream, addrs, &settings).await {
                debug!("Stream {} from {} ended: {}", id, addrs.peer, e);
            }
        });
    }

    session.close();
    info!("Session with {} closed", addrs.peer);
}

/// Where a stream goes: its own destination, else the forward target
fn stream_target(destination: Option<&AddrSpec>, settings: &ServerSettings) -> Result<String> {
    match destination {
        Some(dest) => Ok(dest.to_string()),
        None => settings
            .forward
            .clone()
            .ok_or_else(|| Error::Config("stream has no destination and no forward target is set".into())),
    }
}

/// SOCKS5 reply code for a failed forward dial
fn dial_failure(err: &TransportError) -> Reply {
    match err {
        TransportError::Timeout => Reply::TtlExpired,
        TransportError::Io(e) => Reply::from(&connect_error(e)),
        _ => Reply::GeneralFailure,
    }
}

/// Dial a multiplexed stream's target, report the outcome to the opener,
/// then relay until either side ends
async fn forward_mux_stream(
    stream: MuxStream,
    addrs: TunnelAddrs,
    settings: &ServerSettings,
) -> Result<()> {
    let target = stream_target(stream.destination(), settings);
    let target = match target {
        Ok(target) => target,
        Err(e) => {
            let _ = stream.refuse_open(Reply::GeneralFailure as u8).await;
            return Err(e);
        }
    };

    let remote = match connect(&target, settings.connect_timeout).await {
        Ok(remote) => remote,
        Err(e) => {
            let _ = stream.refuse_open(dial_failure(&e) as u8).await;
            return Err(e.into());
        }
    };

    let target_addr = remote.peer_addr()?;
    if let Err(e) = check_loop(&addrs, target_addr) {
        let _ = stream.refuse_open(Reply::ConnectionNotAllowed as u8).await;
        return Err(e.into());
    }

    stream.confirm_open().await?;
    debug!("Forwarding {} to {}", addrs.peer, target);

    let stats = relay(stream, remote, &settings.relay).await?;
    debug!("Relay {} <-> {} done: {}", addrs.peer, target, stats);
    Ok(())
}

/// Dial the forward target for a chunked channel and relay until either
/// side ends
async fn forward_stream<T>(stream: T, addrs: TunnelAddrs, settings: &ServerSettings) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let target = stream_target(None, settings)?;
    let remote = connect(&target, settings.connect_timeout).await?;
    debug!("Forwarding {} to {}", addrs.peer, target);

    let stats = relay_to_target(stream, &addrs, remote, &settings.relay).await?;
    debug!("Relay {} <-> {} done: {}", addrs.peer, target, stats);
    Ok(())
}
