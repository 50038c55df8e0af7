//! Raw TCP dialing

use super::TransportError;
use std::time::Duration;
use tokio::net::TcpStream;

/// Connect to `addr`, failing with [`TransportError::Timeout`] after `timeout`
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(TransportError::Io)?;

    // Small control frames should not wait on Nagle
    stream.set_nodelay(true).ok();

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_and_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let mut stream = connect(&addr.to_string(), Duration::from_secs(5)).await.unwrap();
        stream.write_all(b"Hello, TCP!").await.unwrap();

        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Hello, TCP!");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(&addr.to_string(), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }
}
