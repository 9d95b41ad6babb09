//! Outbound side of a client connection.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Write half of a client connection as seen by an agent.
///
/// Reading is owned by the read path; the agent only writes and closes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write the whole buffer.
    async fn write(&self, data: &[u8]) -> io::Result<()>;

    /// Release the connection. Calling it again is a no-op.
    async fn close(&self) -> io::Result<()>;

    /// Remote address of the client.
    fn remote_addr(&self) -> SocketAddr;
}

/// [`Transport`] over any async writer (a TCP write half, an in-memory duplex).
pub struct StreamTransport<W> {
    writer: Mutex<Option<W>>,
    remote_addr: SocketAddr,
}

impl<W> StreamTransport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap `writer`, reporting `remote_addr` as the peer.
    pub fn new(writer: W, remote_addr: SocketAddr) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
            remote_addr,
        }
    }

    /// Whether `close` has run.
    pub async fn is_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }
}

#[async_trait]
impl<W> Transport for StreamTransport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"))?;
        writer.write_all(data).await?;
        writer.flush().await
    }

    async fn close(&self) -> io::Result<()> {
        let Some(mut writer) = self.writer.lock().await.take() else {
            return Ok(());
        };
        writer.shutdown().await
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn addr() -> SocketAddr {
        "10.0.0.7:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn writes_reach_the_peer() {
        let (client, mut server) = tokio::io::duplex(64);
        let transport = StreamTransport::new(client, addr());

        transport.write(b"hello").await.unwrap();
        let mut buf = [0_u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(transport.remote_addr(), addr());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_signals_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        let transport = StreamTransport::new(client, addr());

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.is_closed().await);

        let mut buf = Vec::new();
        let n = server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn write_after_close_is_broken_pipe() {
        let (client, _server) = tokio::io::duplex(64);
        let transport = StreamTransport::new(client, addr());
        transport.close().await.unwrap();

        let err = transport.write(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn write_to_dropped_peer_fails() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let transport = StreamTransport::new(client, addr());
        assert!(transport.write(b"x").await.is_err());
    }
}
