//! Async UDP socket wrapper for ClawChat transport.
//!
//! Provides a high-level interface for sending and receiving record
//! frames over UDP.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

/// Default receive buffer size.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 65535;

/// Async UDP socket wrapper for ClawChat.
///
/// Provides convenient methods for sending/receiving frames with
/// proper buffer management.
#[derive(Debug)]
pub struct ClawSocket {
    /// The underlying UDP socket.
    socket: Arc<UdpSocket>,
    /// Receive buffer.
    recv_buffer: Vec<u8>,
}

impl ClawSocket {
    /// Create a ClawChat socket bound to the given address.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket))
    }

    /// Bind to an ephemeral port on the given address.
    pub async fn bind_ephemeral(addr: std::net::IpAddr) -> io::Result<Self> {
        Self::bind(SocketAddr::new(addr, 0)).await
    }

    /// Create a ClawChat socket from an existing UDP socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            recv_buffer: vec![0u8; DEFAULT_RECV_BUFFER_SIZE],
        }
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send data to a specific address.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr).await
    }

    /// Receive data and return the sender's address.
    pub async fn recv_from(&mut self) -> io::Result<(&[u8], SocketAddr)> {
        let (len, addr) = self.socket.recv_from(&mut self.recv_buffer).await?;
        Ok((&self.recv_buffer[..len], addr))
    }

    /// Get a reference to the underlying socket.
    pub fn inner(&self) -> &UdpSocket {
        &self.socket
    }

    /// Get a clone of the Arc-wrapped socket.
    pub fn socket_arc(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }
}

/// Builder for creating ClawChat sockets with custom options.
#[derive(Debug, Clone)]
pub struct ClawSocketBuilder {
    recv_buffer_size: usize,
}

impl Default for ClawSocketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClawSocketBuilder {
    /// Create a new socket builder with default options.
    pub fn new() -> Self {
        Self {
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }

    /// Set the receive buffer size.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Bind to the given address and create a socket.
    pub async fn bind(self, addr: SocketAddr) -> io::Result<ClawSocket> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(self.from_socket(socket))
    }

    /// Create a socket from an existing UDP socket.
    pub fn from_socket(self, socket: UdpSocket) -> ClawSocket {
        ClawSocket {
            socket: Arc::new(socket),
            recv_buffer: vec![0u8; self.recv_buffer_size],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_socket_bind() {
        let socket = ClawSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.port() != 0);
    }

    #[tokio::test]
    async fn test_socket_send_recv() {
        let mut server = ClawSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = ClawSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let data = b"hello clawchat";
        client.send_to(data, server_addr).await.unwrap();

        let (received, from) = server.recv_from().await.unwrap();
        assert_eq!(received, data);
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let socket = ClawSocket::bind_ephemeral("127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        assert!(socket.local_addr().unwrap().port() != 0);
    }

    #[test]
    fn test_socket_builder() {
        let builder = ClawSocketBuilder::new().recv_buffer_size(4096);
        assert_eq!(builder.recv_buffer_size, 4096);
    }
}
