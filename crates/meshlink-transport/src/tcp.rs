//! TCP transport for network-attached radio modules.
//!
//! Some deployments put the module behind a serial-over-IP gateway or a
//! carrier board with an Ethernet interface. [`TcpTransport`] implements
//! the [`Transport`] trait over a plain TCP stream so the same protocol
//! engine drives those modules unchanged.

use async_trait::async_trait;
use meshlink_core::error::{Error, Result};
use meshlink_core::transport::Transport;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Timeout for establishing the TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP socket transport for radio module communication.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    /// Peer description for logging/debugging.
    peer: String,
}

impl TcpTransport {
    /// Connect to a module at the given host and port.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        tracing::debug!(addr = %addr, "Connecting TCP transport");

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Transport(format!("TCP connect to {} failed: {}", addr, e)))?;

        // Disable Nagle for low-latency command/response traffic.
        let _ = stream.set_nodelay(true);

        tracing::info!(addr = %addr, "TCP transport connected");

        Ok(Self {
            stream: Some(stream),
            peer: addr,
        })
    }

    /// The peer address this transport is connected to.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::InterfaceNotOpen)?;

        tracing::trace!(peer = %self.peer, bytes = data.len(), "Sending data");

        stream.write_all(data).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe
                || e.kind() == std::io::ErrorKind::ConnectionReset
            {
                Error::ConnectionLost
            } else {
                Error::Io(e)
            }
        })?;
        stream.flush().await.map_err(Error::Io)?;
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::InterfaceNotOpen)?;

        match tokio::time::timeout(timeout, stream.read(buf)).await {
            // A zero-byte read on TCP means the peer closed the connection.
            Ok(Ok(0)) => Err(Error::ConnectionLost),
            Ok(Ok(n)) => {
                tracing::trace!(peer = %self.peer, bytes = n, "Received data");
                Ok(n)
            }
            Ok(Err(e)) => {
                if e.kind() == std::io::ErrorKind::ConnectionReset {
                    Err(Error::ConnectionLost)
                } else {
                    Err(Error::Io(e))
                }
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            tracing::debug!(peer = %self.peer, "Closing TCP transport");
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_transport_connect_and_exchange() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Echo server for one connection.
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
        });

        let mut transport = TcpTransport::connect("127.0.0.1", addr.port()).await.unwrap();
        assert!(transport.is_connected());

        transport.send(&[0x7E, 0x00, 0x01]).await.unwrap();

        let mut buf = [0u8; 64];
        let n = transport
            .receive(&mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[0x7E, 0x00, 0x01]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_transport_closed_operations_fail() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let mut transport = TcpTransport::connect("127.0.0.1", addr.port()).await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_connected());

        let result = transport.send(&[0x01]).await;
        assert!(matches!(result.unwrap_err(), Error::InterfaceNotOpen));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_transport_connect_refused() {
        // Bind then drop to get a port with no listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpTransport::connect("127.0.0.1", port).await;
        assert!(result.is_err());
    }
}
