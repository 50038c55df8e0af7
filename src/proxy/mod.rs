//! Proxy front-ends
//!
//! Provides:
//! - SOCKS5 CONNECT server
//! - SOCKS5 destination addresses, shared with the stream-open frame
//! - Outbound connectors (direct dial, or through the tunnel)

mod socks5;

pub use socks5::{encode_reply, handle_connection, negotiate, Reply, Socks5Server};

use crate::tunnel::BoxedStream;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Host unreachable")]
    HostUnreachable,

    #[error("Network unreachable")]
    NetworkUnreachable,

    #[error("TTL expired")]
    TtlExpired,

    #[error("Connection not allowed")]
    NotAllowed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("General failure: {0}")]
    GeneralFailure(String),
}

/// SOCKS5 address type bytes
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Destination host: an IP or a domain name, never both
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ip(IpAddr),
    Fqdn(String),
}

/// Longest domain name the one-byte SOCKS5 length field can carry
pub const MAX_FQDN_LEN: usize = 255;

/// A destination address and port.
///
/// Domain names are 1 to `MAX_FQDN_LEN` bytes, so every value has a SOCKS5
/// encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddrSpec {
    host: Host,
    port: u16,
}

impl AddrSpec {
    pub fn new(host: Host, port: u16) -> Result<Self, ProxyError> {
        if let Host::Fqdn(name) = &host {
            if name.is_empty() || name.len() > MAX_FQDN_LEN {
                return Err(ProxyError::InvalidAddress(format!(
                    "domain name must be 1 to {} bytes, got {}",
                    MAX_FQDN_LEN,
                    name.len()
                )));
            }
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Read the SOCKS5 address encoding: type byte, address, big-endian port.
    ///
    /// A body shorter than its declared length fails with an
    /// `UnexpectedEof` I/O error.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProxyError> {
        let atyp = reader.read_u8().await?;
        let host = match atyp {
            ATYP_IPV4 => {
                let mut ip = [0u8; 4];
                reader.read_exact(&mut ip).await?;
                Host::Ip(IpAddr::V4(Ipv4Addr::from(ip)))
            }
            ATYP_IPV6 => {
                let mut ip = [0u8; 16];
                reader.read_exact(&mut ip).await?;
                Host::Ip(IpAddr::V6(Ipv6Addr::from(ip)))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                reader.read_exact(&mut name).await?;
                Host::Fqdn(
                    String::from_utf8(name)
                        .map_err(|_| ProxyError::InvalidAddress("domain is not UTF-8".to_string()))?,
                )
            }
            other => return Err(ProxyError::UnsupportedAddressType(other)),
        };
        let port = reader.read_u16().await?;
        Self::new(host, port)
    }

    /// Parse an encoded address that must fill `buf` exactly
    pub fn from_bytes(mut buf: &[u8]) -> Result<Self, ProxyError> {
        let truncated = || ProxyError::InvalidAddress("truncated address".to_string());
        if buf.is_empty() {
            return Err(truncated());
        }
        let host = match buf.get_u8() {
            ATYP_IPV4 if buf.remaining() >= 4 => {
                let mut ip = [0u8; 4];
                buf.copy_to_slice(&mut ip);
                Host::Ip(IpAddr::V4(Ipv4Addr::from(ip)))
            }
            ATYP_IPV6 if buf.remaining() >= 16 => {
                let mut ip = [0u8; 16];
                buf.copy_to_slice(&mut ip);
                Host::Ip(IpAddr::V6(Ipv6Addr::from(ip)))
            }
            ATYP_DOMAIN if buf.remaining() >= 1 => {
                let len = buf.get_u8() as usize;
                if buf.remaining() < len {
                    return Err(truncated());
                }
                let name = String::from_utf8(buf[..len].to_vec())
                    .map_err(|_| ProxyError::InvalidAddress("domain is not UTF-8".to_string()))?;
                buf.advance(len);
                Host::Fqdn(name)
            }
            ATYP_IPV4 | ATYP_IPV6 | ATYP_DOMAIN => return Err(truncated()),
            other => return Err(ProxyError::UnsupportedAddressType(other)),
        };
        if buf.remaining() != 2 {
            return Err(truncated());
        }
        let port = buf.get_u16();
        Self::new(host, port)
    }

    /// Append the SOCKS5 encoding of this address
    pub fn encode(&self, buf: &mut BytesMut) {
        match &self.host {
            Host::Ip(IpAddr::V4(ip)) => {
                buf.put_u8(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Host::Ip(IpAddr::V6(ip)) => {
                buf.put_u8(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
            Host::Fqdn(name) => {
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
            }
        }
        buf.put_u16(self.port);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(22);
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// The unspecified IPv4 address, used in failure replies
    pub fn unspecified() -> Self {
        Self {
            host: Host::Ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port: 0,
        }
    }
}

impl From<SocketAddr> for AddrSpec {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: Host::Ip(addr.ip()),
            port: addr.port(),
        }
    }
}

impl FromStr for AddrSpec {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::InvalidAddress(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| ProxyError::InvalidAddress(s.to_string()))?;
        if host.contains(':') {
            return Err(ProxyError::InvalidAddress(s.to_string()));
        }
        Self::new(Host::Fqdn(host.to_string()), port)
    }
}

impl fmt::Display for AddrSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            Host::Ip(ip) => write!(f, "{}:{}", ip, self.port),
            Host::Fqdn(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

/// Opens the outbound side for a proxied connection
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, destination: &AddrSpec) -> Result<BoxedStream, ProxyError>;
}

/// Dials destinations directly
pub struct DirectConnector {
    timeout: Duration,
}

impl DirectConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Connector for DirectConnector {
    async fn connect(&self, destination: &AddrSpec) -> Result<BoxedStream, ProxyError> {
        let addrs: Vec<SocketAddr> = match &destination.host {
            Host::Ip(ip) => vec![SocketAddr::new(*ip, destination.port)],
            Host::Fqdn(name) => tokio::net::lookup_host((name.as_str(), destination.port))
                .await
                .map_err(|_| ProxyError::HostUnreachable)?
                .collect(),
        };

        let mut last_err = ProxyError::HostUnreachable;
        for addr in addrs {
            match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true).ok();
                    debug!("Connected to {} ({})", destination, addr);
                    return Ok(Box::new(stream));
                }
                Ok(Err(e)) => last_err = connect_error(&e),
                Err(_) => last_err = ProxyError::TtlExpired,
            }
        }
        Err(last_err)
    }
}

/// Classify a failed outbound connect
pub fn connect_error(e: &io::Error) -> ProxyError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ProxyError::ConnectionRefused,
        io::ErrorKind::HostUnreachable => ProxyError::HostUnreachable,
        io::ErrorKind::NetworkUnreachable => ProxyError::NetworkUnreachable,
        io::ErrorKind::TimedOut => ProxyError::TtlExpired,
        _ => ProxyError::GeneralFailure(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parse_ipv4() {
        let bytes = [ATYP_IPV4, 1, 2, 3, 4, 0x1F, 0x90];
        let addr = AddrSpec::read_from(&mut &bytes[..]).await.unwrap();
        assert_eq!(addr.host(), &Host::Ip(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
        assert_eq!(addr.port(), 8080);
    }

    #[tokio::test]
    async fn test_parse_fqdn() {
        let mut bytes = vec![ATYP_DOMAIN, 11];
        bytes.extend_from_slice(b"example.com");
        bytes.extend_from_slice(&443u16.to_be_bytes());
        let addr = AddrSpec::read_from(&mut &bytes[..]).await.unwrap();
        assert_eq!(addr.host(), &Host::Fqdn("example.com".to_string()));
        assert_eq!(addr.to_string(), "example.com:443");
    }

    #[tokio::test]
    async fn test_fqdn_length_mismatch_is_short_read() {
        // Declared length 13, but only "example.com" plus a port follows.
        let mut bytes = vec![ATYP_DOMAIN, 13];
        bytes.extend_from_slice(b"example.com");
        bytes.extend_from_slice(&80u16.to_be_bytes());

        match AddrSpec::read_from(&mut &bytes[..]).await {
            Err(ProxyError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected short read, got {:?}", other),
        }
        assert!(AddrSpec::from_bytes(&bytes).is_err());
    }

    #[tokio::test]
    async fn test_parse_ipv6_and_unknown_type() {
        let mut bytes = vec![ATYP_IPV6];
        bytes.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        bytes.extend_from_slice(&22u16.to_be_bytes());
        let addr = AddrSpec::read_from(&mut &bytes[..]).await.unwrap();
        assert_eq!(addr.to_string(), "[::1]:22");

        let bytes = [0x05u8, 0, 0];
        assert!(matches!(
            AddrSpec::read_from(&mut &bytes[..]).await,
            Err(ProxyError::UnsupportedAddressType(5))
        ));
    }

    #[test]
    fn test_encoding_matches_parser() {
        let addr: AddrSpec = "tunnel.example.org:8443".parse().unwrap();
        let bytes = addr.to_bytes();
        assert_eq!(bytes[0], ATYP_DOMAIN);
        assert_eq!(bytes[1] as usize, "tunnel.example.org".len());
        assert_eq!(AddrSpec::from_bytes(&bytes).unwrap(), addr);

        let addr: AddrSpec = "[2001:db8::1]:53".parse().unwrap();
        assert_eq!(AddrSpec::from_bytes(&addr.to_bytes()).unwrap(), addr);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("no-port".parse::<AddrSpec>().is_err());
        assert!("host:notaport".parse::<AddrSpec>().is_err());
        assert!(":80".parse::<AddrSpec>().is_err());
    }

    #[test]
    fn test_overlong_domain_rejected() {
        let name = "a".repeat(300);
        assert!(matches!(
            AddrSpec::new(Host::Fqdn(name.clone()), 80),
            Err(ProxyError::InvalidAddress(_))
        ));
        assert!(format!("{}:80", name).parse::<AddrSpec>().is_err());
        assert!(AddrSpec::new(Host::Fqdn(String::new()), 80).is_err());

        let longest = AddrSpec::new(Host::Fqdn("b".repeat(MAX_FQDN_LEN)), 80).unwrap();
        let bytes = longest.to_bytes();
        assert_eq!(bytes[1], 255);
        assert_eq!(bytes.len(), 2 + MAX_FQDN_LEN + 2);
        assert_eq!(AddrSpec::from_bytes(&bytes).unwrap(), longest);
    }

    #[tokio::test]
    async fn test_direct_connector_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = DirectConnector::new(Duration::from_secs(2));
        let result = connector.connect(&AddrSpec::from(addr)).await;
        assert!(matches!(result, Err(ProxyError::ConnectionRefused)));
    }
}
