//! The server-side backend gateway.
//!
//! Ingress (session to backend): record framing is stripped and each
//! application frame becomes one datagram of
//! `[message_type:1 || opaque_payload]` on the local backend socket.
//! Egress (backend to session): one datagram is parsed back into
//! `(message_type, payload)` and sealed onto the session, preserving
//! message type and payload bytes exactly in both directions.
//!
//! The backend is an external collaborator reached over loopback; no
//! encryption is applied on that path. If it is unreachable or silent
//! past the reply budget, the peer gets an ERROR frame carrying
//! BACKEND_UNAVAILABLE and the session stays open.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::{BACKEND_REPLY_TIMEOUT, DEFAULT_BACKEND_PORT, RelayError};
use crate::record::MessageType;

/// Relay gateway configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// The local backend endpoint.
    pub backend_addr: SocketAddr,
    /// How long to wait for a backend reply before surfacing
    /// BACKEND_UNAVAILABLE.
    pub reply_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend_addr: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                DEFAULT_BACKEND_PORT,
            ),
            reply_timeout: BACKEND_REPLY_TIMEOUT,
        }
    }
}

/// Forwards application traffic between the session and the backend.
pub struct RelayGateway {
    socket: UdpSocket,
    reply_timeout: Duration,
    /// When the oldest still-unanswered forward went out.
    oldest_outstanding: Option<Instant>,
}

impl RelayGateway {
    /// Bind a loopback socket and connect it to the backend endpoint.
    pub async fn new(config: &RelayConfig) -> Result<Self, RelayError> {
        let bind_addr = SocketAddr::new(config.backend_addr.ip(), 0);
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(config.backend_addr).await?;
        Ok(Self {
            socket,
            reply_timeout: config.reply_timeout,
            oldest_outstanding: None,
        })
    }

    /// Forward one application frame to the backend.
    ///
    /// An immediate send failure (e.g. ICMP port unreachable surfaced on
    /// the connected socket) reports the backend unavailable.
    pub async fn forward(
        &mut self,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<(), RelayError> {
        let mut datagram = Vec::with_capacity(1 + payload.len());
        datagram.push(message_type.as_byte());
        datagram.extend_from_slice(payload);

        match self.socket.send(&datagram).await {
            Ok(_) => {
                if self.oldest_outstanding.is_none() {
                    self.oldest_outstanding = Some(Instant::now());
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                warn!("backend refused datagram");
                Err(RelayError::BackendUnavailable)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Receive the next backend reply.
    ///
    /// Datagrams that do not parse as `[application_type || payload]`
    /// are dropped and the wait continues. Cancel-safe: the server loop
    /// selects over this alongside the session socket.
    pub async fn recv_reply(&mut self) -> Result<(MessageType, Vec<u8>), RelayError> {
        let mut buf = [0u8; 2048];
        loop {
            let len = match self.socket.recv(&mut buf).await {
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    warn!("backend unreachable");
                    self.oldest_outstanding = None;
                    return Err(RelayError::BackendUnavailable);
                }
                Err(e) => return Err(e.into()),
            };
            match parse_backend_datagram(&buf[..len]) {
                Some((message_type, payload)) => {
                    self.oldest_outstanding = None;
                    return Ok((message_type, payload));
                }
                None => {
                    debug!("dropping malformed backend datagram");
                }
            }
        }
    }

    /// Whether the oldest unanswered forward has exceeded the reply
    /// budget. Returns true once per expiry; the caller emits the ERROR
    /// frame.
    pub fn reply_timed_out(&mut self) -> bool {
        match self.oldest_outstanding {
            Some(sent_at) if sent_at.elapsed() >= self.reply_timeout => {
                self.oldest_outstanding = None;
                true
            }
            _ => false,
        }
    }
}

/// Parse a backend datagram: `[message_type:1 || opaque_payload]` where
/// the type must be an application kind.
fn parse_backend_datagram(data: &[u8]) -> Option<(MessageType, Vec<u8>)> {
    let (&type_byte, payload) = data.split_first()?;
    let message_type = MessageType::from_byte(type_byte)?;
    if !message_type.is_application() {
        return None;
    }
    Some((message_type, payload.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_echo_backend() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (len, from) = socket.recv_from(&mut buf).await.unwrap();
                // CHAT_REQUEST "ping" becomes CHAT_RESPONSE "pong";
                // everything else echoes with the same type.
                let reply = match (buf[0], &buf[1..len]) {
                    (0x20, b"ping") => {
                        let mut r = vec![0x21];
                        r.extend_from_slice(b"pong");
                        r
                    }
                    _ => buf[..len].to_vec(),
                };
                socket.send_to(&reply, from).await.unwrap();
            }
        });
        addr
    }

    fn config_for(backend_addr: SocketAddr) -> RelayConfig {
        RelayConfig {
            backend_addr,
            reply_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_forward_and_reply_preserve_bytes() {
        let backend = spawn_echo_backend().await;
        let mut gateway = RelayGateway::new(&config_for(backend)).await.unwrap();

        gateway
            .forward(MessageType::ChatRequest, b"ping")
            .await
            .unwrap();
        let (message_type, payload) = gateway.recv_reply().await.unwrap();
        assert_eq!(message_type, MessageType::ChatResponse);
        assert_eq!(payload, b"pong");
    }

    #[tokio::test]
    async fn test_every_application_kind_roundtrips() {
        let backend = spawn_echo_backend().await;
        let mut gateway = RelayGateway::new(&config_for(backend)).await.unwrap();

        for kind in [
            MessageType::FileList,
            MessageType::FileDownloadChunk,
            MessageType::FileUploadChunk,
            MessageType::FileDelete,
            MessageType::FileRename,
            MessageType::FileMkdir,
            MessageType::FileStat,
            MessageType::CronList,
            MessageType::CronAdd,
            MessageType::CronRemove,
            MessageType::CronRun,
            MessageType::CronReload,
            MessageType::CronResult,
        ] {
            let payload = vec![kind.as_byte(), 0x00, 0xFF, 0x7F];
            gateway.forward(kind, &payload).await.unwrap();
            let (echoed_kind, echoed_payload) = gateway.recv_reply().await.unwrap();
            assert_eq!(echoed_kind, kind);
            assert_eq!(echoed_payload, payload);
        }
    }

    #[tokio::test]
    async fn test_empty_payload_roundtrips() {
        let backend = spawn_echo_backend().await;
        let mut gateway = RelayGateway::new(&config_for(backend)).await.unwrap();

        gateway.forward(MessageType::CronList, b"").await.unwrap();
        let (message_type, payload) = gateway.recv_reply().await.unwrap();
        assert_eq!(message_type, MessageType::CronList);
        assert!(payload.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_timeout_fires_once() {
        // Backend exists but never replies.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = RelayConfig {
            backend_addr: silent.local_addr().unwrap(),
            reply_timeout: Duration::from_secs(60),
        };
        let mut gateway = RelayGateway::new(&config).await.unwrap();

        gateway
            .forward(MessageType::ChatRequest, b"ping")
            .await
            .unwrap();
        assert!(!gateway.reply_timed_out());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(gateway.reply_timed_out());
        // Reported once, then rearmed by the next forward.
        assert!(!gateway.reply_timed_out());
    }

    #[tokio::test]
    async fn test_malformed_backend_datagrams_skipped() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (_, from) = socket.recv_from(&mut buf).await.unwrap();
            // Unknown opcode, then a transport opcode, then a valid reply.
            socket.send_to(&[0xEE, 1, 2], from).await.unwrap();
            socket.send_to(&[0x03], from).await.unwrap();
            socket.send_to(&[0x21, b'o', b'k'], from).await.unwrap();
        });

        let mut gateway = RelayGateway::new(&config_for(addr)).await.unwrap();
        gateway
            .forward(MessageType::ChatRequest, b"hi")
            .await
            .unwrap();
        let (message_type, payload) = gateway.recv_reply().await.unwrap();
        assert_eq!(message_type, MessageType::ChatResponse);
        assert_eq!(payload, b"ok");
    }

    #[test]
    fn test_parse_backend_datagram() {
        assert_eq!(
            parse_backend_datagram(&[0x20, b'h', b'i']),
            Some((MessageType::ChatRequest, b"hi".to_vec()))
        );
        assert_eq!(parse_backend_datagram(&[]), None);
        assert_eq!(parse_backend_datagram(&[0x03, 0x00]), None);
        assert_eq!(parse_backend_datagram(&[0xEE]), None);
    }
}
