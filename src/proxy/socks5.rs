//! SOCKS5 proxy implementation (RFC 1928, CONNECT only)

use super::{AddrSpec, Connector, ProxyError};
use crate::protocol::accept_backoff;
use crate::relay::{relay, RelayConfig};
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl TryFrom<u8> for Reply {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Reply::Succeeded),
            0x01 => Ok(Reply::GeneralFailure),
            0x02 => Ok(Reply::ConnectionNotAllowed),
            0x03 => Ok(Reply::NetworkUnreachable),
            0x04 => Ok(Reply::HostUnreachable),
            0x05 => Ok(Reply::ConnectionRefused),
            0x06 => Ok(Reply::TtlExpired),
            0x07 => Ok(Reply::CommandNotSupported),
            0x08 => Ok(Reply::AddressTypeNotSupported),
            _ => Err(ProxyError::GeneralFailure(format!("unknown reply code {}", value))),
        }
    }
}

impl From<&ProxyError> for Reply {
    fn from(err: &ProxyError) -> Self {
        match err {
            ProxyError::ConnectionRefused => Reply::ConnectionRefused,
            ProxyError::NotAllowed => Reply::ConnectionNotAllowed,
            ProxyError::HostUnreachable => Reply::HostUnreachable,
            ProxyError::NetworkUnreachable => Reply::NetworkUnreachable,
            ProxyError::TtlExpired => Reply::TtlExpired,
            ProxyError::UnsupportedCommand(_) | ProxyError::InvalidSocksVersion(_) => {
                Reply::CommandNotSupported
            }
            ProxyError::UnsupportedAddressType(_) => Reply::AddressTypeNotSupported,
            _ => Reply::GeneralFailure,
        }
    }
}

/// Encode a reply: 4-byte header, then the address body and port.
/// `None` encodes as IPv4 `0.0.0.0:0`.
pub fn encode_reply(reply: Reply, addr: Option<&AddrSpec>) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(SOCKS_VERSION);
    buf.put_u8(reply as u8);
    buf.put_u8(0x00);
    match addr {
        Some(addr) => addr.encode(&mut buf),
        None => AddrSpec::unspecified().encode(&mut buf),
    }
    buf.to_vec()
}

/// Run method negotiation and read the request.
///
/// Returns the CONNECT destination. Anything else gets a negative reply
/// written to `stream` and an error.
pub async fn negotiate<S>(stream: &mut S) -> Result<AddrSpec, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: version, method count, methods
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(version));
    }
    let nmethods = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&(AuthMethod::NoAuth as u8)) {
        stream
            .write_all(&[SOCKS_VERSION, AuthMethod::NoAcceptable as u8])
            .await?;
        return Err(ProxyError::NoAcceptableMethod);
    }
    stream.write_all(&[SOCKS_VERSION, AuthMethod::NoAuth as u8]).await?;

    // Request: version, command, reserved, then the address
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        let err = ProxyError::InvalidSocksVersion(header[0]);
        stream.write_all(&encode_reply(Reply::from(&err), None)).await?;
        return Err(err);
    }

    let command = match Command::try_from(header[1]) {
        Ok(Command::Connect) => Command::Connect,
        Ok(other) => {
            stream
                .write_all(&encode_reply(Reply::CommandNotSupported, None))
                .await?;
            return Err(ProxyError::UnsupportedCommand(other as u8));
        }
        Err(err) => {
            stream.write_all(&encode_reply(Reply::from(&err), None)).await?;
            return Err(err);
        }
    };

    let destination = match AddrSpec::read_from(stream).await {
        Ok(dest) => dest,
        Err(err @ ProxyError::UnsupportedAddressType(_)) => {
            stream.write_all(&encode_reply(Reply::from(&err), None)).await?;
            return Err(err);
        }
        Err(err) => return Err(err),
    };

    debug!("SOCKS5 {:?} to {}", command, destination);
    Ok(destination)
}

/// Serve one SOCKS5 client: negotiate, connect, reply, then relay.
pub async fn handle_connection<S, C>(
    mut stream: S,
    connector: &C,
    relay_config: &RelayConfig,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    C: Connector + ?Sized,
{
    let destination = negotiate(&mut stream).await?;

    let remote = match connector.connect(&destination).await {
        Ok(remote) => remote,
        Err(err) => {
            debug!("Connect to {} failed: {}", destination, err);
            stream.write_all(&encode_reply(Reply::from(&err), None)).await?;
            return Err(err);
        }
    };

    stream
        .write_all(&encode_reply(Reply::Succeeded, Some(&destination)))
        .await?;

    match relay(stream, remote, relay_config).await {
        Ok(stats) => debug!("SOCKS5 relay to {} done: {}", destination, stats),
        Err(e) => debug!("SOCKS5 relay to {} ended: {}", destination, e),
    }
    Ok(())
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    listener: TcpListener,
}

impl Socks5Server {
    /// Bind the SOCKS5 listener
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 server listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and handle incoming connections
    pub async fn run(
        &self,
        connector: Arc<dyn Connector>,
        relay_config: RelayConfig,
    ) -> Result<(), ProxyError> {
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
                    warn!("SOCKS5 accept error: {} (retrying in {:?})", e, pause);
                    tokio::time::sleep(pause).await;
                    continue;
                }
            };
            debug!("New SOCKS5 connection from {}", peer_addr);
            stream.set_nodelay(true).ok();

            let connector = Arc::clone(&connector);
            let relay_config = relay_config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, connector.as_ref(), &relay_config).await {
                    debug!("SOCKS5 connection from {} failed: {}", peer_addr, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::DirectConnector;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_bind_command_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let negotiation = tokio::spawn(async move { negotiate(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        assert!(matches!(
            negotiation.await.unwrap(),
            Err(ProxyError::UnsupportedCommand(0x02))
        ));
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let negotiation = tokio::spawn(async move { negotiate(&mut server).await });

        // Only username/password offered
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0xFF]);
        assert!(matches!(
            negotiation.await.unwrap(),
            Err(ProxyError::NoAcceptableMethod)
        ));
    }

    #[tokio::test]
    async fn test_bad_version_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        assert!(matches!(
            negotiate(&mut server).await,
            Err(ProxyError::InvalidSocksVersion(4))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_address_type_reply() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let negotiation = tokio::spawn(async move { negotiate(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        client.write_all(&[0x05, 0x01, 0x00, 0x09]).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::AddressTypeNotSupported as u8);
        assert!(negotiation.await.unwrap().is_err());
    }

    #[test]
    fn test_reply_encoding() {
        let addr = AddrSpec::from(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 1080)));
        assert_eq!(
            encode_reply(Reply::Succeeded, Some(&addr)),
            vec![0x05, 0x00, 0x00, 0x01, 10, 1, 2, 3, 0x04, 0x38]
        );
        assert_eq!(
            Reply::from(&ProxyError::HostUnreachable),
            Reply::HostUnreachable
        );
        assert_eq!(
            Reply::from(&ProxyError::GeneralFailure("boom".into())),
            Reply::GeneralFailure
        );
        assert_eq!(Reply::try_from(0x05).unwrap(), Reply::ConnectionRefused);
        assert!(Reply::try_from(0x09).is_err());
    }

    #[tokio::test]
    async fn test_connect_and_relay() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let server = Socks5Server::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = server.local_addr().unwrap();
        let connector: Arc<dyn Connector> = Arc::new(DirectConnector::new(Duration::from_secs(5)));
        tokio::spawn(async move { server.run(connector, RelayConfig::default()).await });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00];
        request.extend_from_slice(&AddrSpec::from(target_addr).to_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::Succeeded as u8);

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
    }

    #[tokio::test]
    async fn test_connect_refused_reply() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);

        let (mut client, server) = tokio::io::duplex(1024);
        let connector = DirectConnector::new(Duration::from_secs(5));
        let handler = tokio::spawn(async move {
            handle_connection(server, &connector, &RelayConfig::default()).await
        });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        let mut request = vec![0x05, 0x01, 0x00];
        request.extend_from_slice(&AddrSpec::from(closed_addr).to_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::ConnectionRefused as u8);
        assert!(matches!(
            handler.await.unwrap(),
            Err(ProxyError::ConnectionRefused)
        ));
    }
}
