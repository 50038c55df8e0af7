//! Tunnel client
//!
//! Local listeners that feed the tunnel: a raw port forward, where every
//! accepted connection becomes a stream to the server's forward target, and
//! a SOCKS5 frontend whose CONNECT destinations travel inside the stream.

use crate::protocol::accept_backoff;
use crate::proxy::{AddrSpec, Connector, ProxyError, Reply, Socks5Server};
use crate::relay::{relay, RelayConfig};
use crate::tunnel::{
    Backend, BoxedStream, ChunkedDialer, Multiplexer, SessionClient, SessionConfig, TunnelError,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Runtime settings for a tunnel client
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server: String,
    pub secret: String,
    pub local_listen: Option<String>,
    pub socks5_listen: Option<String>,
    pub backend: Backend,
    pub connect_timeout: Duration,
    pub session: SessionConfig,
    pub relay: RelayConfig,
}

impl ClientSettings {
    /// Build the multiplexer for the configured backend
    pub fn multiplexer(&self) -> Arc<dyn Multiplexer> {
        match self.backend {
            Backend::Direct => Arc::new(SessionClient::new(
                self.server.clone(),
                self.secret.clone(),
                self.connect_timeout,
                self.session.clone(),
            )),
            Backend::Chunked => Arc::new(ChunkedDialer::new(
                self.server.clone(),
                self.secret.clone(),
                self.connect_timeout,
            )),
        }
    }
}

/// Raw port-forward listener
pub struct ForwardListener {
    listener: TcpListener,
}

impl ForwardListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Forward listener bound on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept local connections and relay each over its own stream
    pub async fn run(&self, mux: Arc<dyn Multiplexer>, relay_config: RelayConfig) -> Result<()> {
        let mut failures = 0u32;
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => {
                    failures = 0;
                    accepted
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let pause = accept_backoff(failures);
                    warn!("Forward accept error: {} (retrying in {:?})", e, pause);
                    tokio::time::sleep(pause).await;
                    continue;
                }
            };
            stream.set_nodelay(true).ok();

            let mux = Arc::clone(&mux);
            let relay_config = relay_config.clone();
            tokio::spawn(async move {
                if let Err(e) = forward_connection(stream, mux.as_ref(), &relay_config).await {
                    warn!("Forwarded connection from {} failed: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn forward_connection(
    stream: TcpStream,
    mux: &dyn Multiplexer,
    relay_config: &RelayConfig,
) -> Result<()> {
    let tunnel = mux.open(None).await?;
    let stats = relay(stream, tunnel, relay_config).await?;
    debug!("Forward relay done: {}", stats);
    Ok(())
}

/// SOCKS5 connector that opens tunnel streams
pub struct TunnelConnector {
    mux: Arc<dyn Multiplexer>,
}

impl TunnelConnector {
    pub fn new(mux: Arc<dyn Multiplexer>) -> Self {
        Self { mux }
    }
}

#[async_trait]
impl Connector for TunnelConnector {
    async fn connect(&self, destination: &AddrSpec) -> std::result::Result<BoxedStream, ProxyError> {
        self.mux
            .open(Some(destination.clone()))
            .await
            .map_err(open_error)
    }
}

/// Map a failed tunnel open to the SOCKS5 failure it stands for
fn open_error(err: TunnelError) -> ProxyError {
    let TunnelError::OpenRefused(status) = err else {
        return ProxyError::GeneralFailure(err.to_string());
    };
    match Reply::try_from(status) {
        Ok(Reply::ConnectionRefused) => ProxyError::ConnectionRefused,
        Ok(Reply::HostUnreachable) => ProxyError::HostUnreachable,
        Ok(Reply::NetworkUnreachable) => ProxyError::NetworkUnreachable,
        Ok(Reply::TtlExpired) => ProxyError::TtlExpired,
        Ok(Reply::ConnectionNotAllowed) => ProxyError::NotAllowed,
        _ => ProxyError::GeneralFailure(format!("tunnel server refused the stream (status {})", status)),
    }
}

/// All local listeners of a client, bound and ready to serve
pub struct TunnelClient {
    forward: Option<ForwardListener>,
    socks5: Option<Socks5Server>,
    mux: Arc<dyn Multiplexer>,
    relay: RelayConfig,
}

impl TunnelClient {
    /// Bind every configured listener. Any bind failure is returned.
    pub async fn bind(settings: &ClientSettings) -> Result<Self> {
        if settings.local_listen.is_none() && settings.socks5_listen.is_none() {
            return Err(Error::Config(
                "client needs local_listen or socks5_listen".into(),
            ));
        }

        let forward = match &settings.local_listen {
            Some(addr) => Some(ForwardListener::bind(addr).await?),
            None => None,
        };
        let socks5 = match &settings.socks5_listen {
            Some(addr) => Some(Socks5Server::bind(addr).await?),
            None => None,
        };

        Ok(Self {
            forward,
            socks5,
            mux: settings.multiplexer(),
            relay: settings.relay.clone(),
        })
    }

    pub fn forward_addr(&self) -> Option<SocketAddr> {
        self.forward.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn socks5_addr(&self) -> Option<SocketAddr> {
        self.socks5.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Serve all listeners until one of them fails
    pub async fn run(self) -> Result<()> {
        let forward = async {
            match &self.forward {
                Some(listener) => listener.run(Arc::clone(&self.mux), self.relay.clone()).await,
                None => std::future::pending().await,
            }
        };
        let socks5 = async {
            match &self.socks5 {
                Some(server) => {
                    let connector: Arc<dyn Connector> =
                        Arc::new(TunnelConnector::new(Arc::clone(&self.mux)));
                    server
                        .run(connector, self.relay.clone())
                        .await
                        .map_err(Error::from)
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = forward => result,
            result = socks5 => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Multiplexer whose streams are in-memory echo pipes
    struct LoopbackMux;

    #[async_trait]
    impl Multiplexer for LoopbackMux {
        async fn open(&self, destination: Option<AddrSpec>) -> std::result::Result<BoxedStream, TunnelError> {
            let (near, far) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let (mut rd, mut wr) = tokio::io::split(far);
                if let Some(dest) = destination {
                    wr.write_all(dest.to_string().as_bytes()).await.ok();
                    wr.write_all(b"|").await.ok();
                }
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
            Ok(Box::new(near))
        }
    }

    /// Multiplexer that never reaches the server
    struct DeadMux;

    #[async_trait]
    impl Multiplexer for DeadMux {
        async fn open(&self, _destination: Option<AddrSpec>) -> std::result::Result<BoxedStream, TunnelError> {
            Err(TunnelError::SessionClosed)
        }
    }

    #[tokio::test]
    async fn test_forward_listener_relays() {
        let listener = ForwardListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { listener.run(Arc::new(LoopbackMux), RelayConfig::default()).await });

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"raw forward").await.unwrap();
        let mut buf = [0u8; 11];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"raw forward");
    }

    #[tokio::test]
    async fn test_tunnel_connector_passes_destination() {
        let connector = TunnelConnector::new(Arc::new(LoopbackMux));
        let dest: AddrSpec = "example.com:443".parse().unwrap();
        let mut stream = connector.connect(&dest).await.unwrap();

        let mut buf = [0u8; 16];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"example.com:443|");
    }

    #[tokio::test]
    async fn test_tunnel_connector_failure_is_general() {
        let connector = TunnelConnector::new(Arc::new(DeadMux));
        let dest: AddrSpec = "10.1.2.3:22".parse().unwrap();
        assert!(matches!(
            connector.connect(&dest).await,
            Err(ProxyError::GeneralFailure(_))
        ));
    }

    /// Multiplexer whose far end refuses every destination with `status`
    struct RefusingMux(u8);

    #[async_trait]
    impl Multiplexer for RefusingMux {
        async fn open(&self, _destination: Option<AddrSpec>) -> std::result::Result<BoxedStream, TunnelError> {
            Err(TunnelError::OpenRefused(self.0))
        }
    }

    #[tokio::test]
    async fn test_tunnel_connector_keeps_refusal_reason() {
        let dest: AddrSpec = "10.1.2.3:22".parse().unwrap();
        let cases = [
            (Reply::ConnectionRefused, "refused"),
            (Reply::HostUnreachable, "host"),
            (Reply::NetworkUnreachable, "network"),
            (Reply::TtlExpired, "ttl"),
            (Reply::ConnectionNotAllowed, "not allowed"),
        ];
        for (reply, label) in cases {
            let connector = TunnelConnector::new(Arc::new(RefusingMux(reply as u8)));
            let err = connector.connect(&dest).await.err().unwrap();
            assert_eq!(Reply::from(&err), reply, "{}", label);
        }

        let connector = TunnelConnector::new(Arc::new(RefusingMux(0x01)));
        assert!(matches!(
            connector.connect(&dest).await,
            Err(ProxyError::GeneralFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_requires_a_listener() {
        let settings = ClientSettings {
            server: "127.0.0.1:1".to_string(),
            secret: "s".to_string(),
            local_listen: None,
            socks5_listen: None,
            backend: Backend::Direct,
            connect_timeout: Duration::from_secs(1),
            session: SessionConfig::default(),
            relay: RelayConfig::default(),
        };
        assert!(matches!(
            TunnelClient::bind(&settings).await,
            Err(Error::Config(_))
        ));
    }
}
