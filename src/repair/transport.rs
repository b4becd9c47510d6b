//! Datagram transport for keyframe requests

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::{ReceiverError, Result};

/// Sends one repair datagram to the stream sender
///
/// Implementations must be cheap to share across the detached repair tasks;
/// the requester holds them behind an `Arc`.
#[async_trait::async_trait]
pub trait RepairTransport: Send + Sync + 'static {
    /// Send `payload` as a single datagram to `target`
    ///
    /// Returns:
    /// - `Ok(())` - The datagram was handed to the network stack
    /// - `Err(e)` - Socket creation or send failed; callers log and carry on
    async fn send(&self, target: SocketAddr, payload: &[u8]) -> Result<()>;
}

/// UDP transport with lazily created sockets.
///
/// No socket exists until the first request is actually sent, so a receiver
/// with repair disabled never opens one. One socket per address family is
/// kept for the lifetime of the transport.
#[derive(Debug, Default)]
pub struct UdpRepairTransport {
    v4: OnceCell<UdpSocket>,
    v6: OnceCell<UdpSocket>,
}

impl UdpRepairTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a socket has been created for either address family
    pub fn is_bound(&self) -> bool {
        self.v4.initialized() || self.v6.initialized()
    }

    async fn socket_for(&self, target: SocketAddr) -> std::io::Result<&UdpSocket> {
        let (cell, local) = match target {
            SocketAddr::V4(_) => (&self.v4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))),
            SocketAddr::V6(_) => (&self.v6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))),
        };
        cell.get_or_try_init(|| async move {
            let socket = UdpSocket::bind(local).await?;
            debug!(local = ?socket.local_addr().ok(), "Repair socket created");
            Ok::<_, std::io::Error>(socket)
        })
        .await
    }
}

#[async_trait::async_trait]
impl RepairTransport for UdpRepairTransport {
    async fn send(&self, target: SocketAddr, payload: &[u8]) -> Result<()> {
        let socket = self.socket_for(target).await.map_err(|source| ReceiverError::Repair { target, source })?;
        socket.send_to(payload, target).await.map_err(|source| ReceiverError::Repair { target, source })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn socket_is_created_on_first_send() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        let transport = UdpRepairTransport::new();
        assert!(!transport.is_bound());

        transport.send(target, b"abc\n").await.unwrap();
        assert!(transport.is_bound());

        let mut buf = [0u8; 16];
        let (len, _) = listener.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"abc\n");
    }

    #[tokio::test]
    async fn socket_is_reused() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let transport = UdpRepairTransport::new();

        transport.send(target, b"abc\n").await.unwrap();
        transport.send(target, b"xyz\n").await.unwrap();

        let mut buf = [0u8; 16];
        let (_, first) = listener.recv_from(&mut buf).await.unwrap();
        let (_, second) = listener.recv_from(&mut buf).await.unwrap();
        assert_eq!(first, second);
    }
}
