//! The session state machine.
//!
//! A `Session` is the single owner of its keys, counters, replay window,
//! and timers. It is written sans-IO: the driving loop (client or
//! server) feeds it received datagrams and periodic ticks, and it
//! returns datagrams to transmit plus events for the owner. All
//! mutation happens on the main loop; crypto operations borrow keys
//! immutably.
//!
//! Phases and transitions:
//! ```text
//! IDLE -> PUNCHING -> ESTABLISHED <-> ROTATING
//!                          |
//!                          v
//!              COMPROMISED_PENDING_ACK -> CLOSED
//! ```
//! Any phase can fall to CLOSED on irrecoverable failure; every path to
//! CLOSED zeroizes the session keys first.

pub mod compromise;
pub mod handshake;
pub mod rotation;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::{
    AUTH_FAIL_CLOSE_THRESHOLD, CompromiseReason, ErrorCode, ProtocolConfig, SessionError,
    decode_socket_addr, encode_socket_addr,
};
use crate::crypto::{ConnectionId, Role};
use crate::record::{MessageType, RecordLayer, RecordStats};

pub use handshake::{HandshakeInitiator, HandshakeResponder, HandshakeResult};

/// Session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No session; the server regenerates artifacts in this phase.
    Idle,
    /// Hole punch in progress.
    Punching,
    /// Bidirectional encrypted channel up.
    Established,
    /// Rotation proposed, waiting for the peer's acknowledgment.
    Rotating,
    /// Compromise declared, waiting for COMPROMISED_ACK.
    CompromisedPendingAck,
    /// Torn down; keys zeroized.
    Closed,
}

impl SessionPhase {
    /// Short name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Punching => "PUNCHING",
            Self::Established => "ESTABLISHED",
            Self::Rotating => "ROTATING",
            Self::CompromisedPendingAck => "COMPROMISED_PENDING_ACK",
            Self::Closed => "CLOSED",
        }
    }
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Local teardown request.
    LocalRequest,
    /// No keepalive reply within the budget.
    KeepaliveTimeout,
    /// Too many consecutive authentication failures.
    AuthFailures,
    /// The compromise protocol completed (or timed out fail-secure).
    Compromise,
    /// Transmit counter exhausted or another unrecoverable fault.
    Fatal,
}

/// Events surfaced to the session owner.
#[derive(Debug)]
pub enum SessionEvent {
    /// An authenticated application frame arrived (relay it, or hand it
    /// to the local application).
    Application {
        /// The frame's message type.
        message_type: MessageType,
        /// The opaque payload bytes.
        payload: Vec<u8>,
    },
    /// A key rotation completed; both generations valid through grace.
    KeysRotated,
    /// The peer announced a new endpoint; subsequent frames go there.
    PortRotation {
        /// The peer's new endpoint.
        new_addr: SocketAddr,
    },
    /// The peer reported an error condition.
    PeerError {
        /// The error code, if recognized.
        code: Option<ErrorCode>,
        /// Any detail bytes after the code.
        detail: Vec<u8>,
    },
    /// The peer declared the session compromised (teardown follows).
    Compromised {
        /// The peer's stated reason.
        reason: CompromiseReason,
    },
    /// The session transitioned to CLOSED; keys are zeroized.
    Closed {
        /// Why the session closed.
        cause: CloseCause,
    },
}

/// Datagrams to transmit and events to surface after feeding the
/// session.
#[derive(Debug, Default)]
pub struct SessionOutput {
    /// Frames to send to the current remote endpoint, in order.
    pub datagrams: Vec<Vec<u8>>,
    /// Events for the session owner, in order.
    pub events: Vec<SessionEvent>,
}

impl SessionOutput {
    fn datagram(frame: Vec<u8>) -> Self {
        Self {
            datagrams: vec![frame],
            events: Vec::new(),
        }
    }

    fn event(event: SessionEvent) -> Self {
        Self {
            datagrams: Vec::new(),
            events: vec![event],
        }
    }

    /// Append another output's datagrams and events, preserving order.
    pub fn push(&mut self, mut other: SessionOutput) {
        self.datagrams.append(&mut other.datagrams);
        self.events.append(&mut other.events);
    }
}

/// Outstanding rotation proposal state (proposer side).
pub(crate) struct PendingRotation {
    pub(crate) contrib: [u8; 32],
}

/// Cache of the last answered rotation (responder side), so a duplicate
/// proposal re-sends the identical acknowledgment instead of deriving a
/// second, conflicting generation.
pub(crate) struct RotationCache {
    pub(crate) contrib: [u8; 32],
    pub(crate) ack_frame: Vec<u8>,
}

/// One end of an established ClawChat session.
pub struct Session {
    pub(crate) phase: SessionPhase,
    pub(crate) role: Role,
    pub(crate) local_id: ConnectionId,
    pub(crate) remote_id: ConnectionId,
    pub(crate) remote: SocketAddr,
    pub(crate) record: RecordLayer,
    pub(crate) rotation_interval: Duration,
    keepalive_interval: Duration,
    keepalive_timeout: Duration,
    pub(crate) next_rotation_at: Instant,
    pub(crate) pending_rotation: Option<PendingRotation>,
    pub(crate) rotation_cache: Option<RotationCache>,
    pub(crate) compromise_deadline: Option<Instant>,
    last_peer_activity: Instant,
    last_ping_at: Instant,
    /// Server side: the handshake ack, re-sent verbatim while the client
    /// retransmits punches because the original ack was lost.
    handshake_ack_cache: Option<Vec<u8>>,
}

impl Session {
    /// Build an established session from a completed handshake.
    pub fn establish(result: HandshakeResult, role: Role, config: &ProtocolConfig) -> Self {
        let now = Instant::now();
        info!(
            remote = %result.remote,
            phase = SessionPhase::Established.name(),
            "session established"
        );
        Self {
            phase: SessionPhase::Established,
            role,
            local_id: result.local_id,
            remote_id: result.remote_id,
            remote: result.remote,
            record: RecordLayer::new(result.keys, config.grace_interval),
            rotation_interval: config.rotation_interval,
            keepalive_interval: config.keepalive_interval,
            keepalive_timeout: config.keepalive_timeout,
            next_rotation_at: now + config.rotation_interval,
            pending_rotation: None,
            rotation_cache: None,
            compromise_deadline: None,
            last_peer_activity: now,
            last_ping_at: now,
            handshake_ack_cache: result.ack_cache,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Current remote endpoint (updated by port rotation).
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// This endpoint's connection identifier.
    pub fn local_id(&self) -> ConnectionId {
        self.local_id
    }

    /// The peer's connection identifier.
    pub fn remote_id(&self) -> ConnectionId {
        self.remote_id
    }

    /// Record-layer counters.
    pub fn stats(&self) -> RecordStats {
        self.record.stats()
    }

    /// Whether every session key is the zero byte-string.
    pub fn keys_zeroized(&self) -> bool {
        self.record.is_zeroized()
    }

    /// Whether this endpoint proposes rotations (lower connection id;
    /// the client breaks an exact tie).
    pub(crate) fn is_rotation_proposer(&self) -> bool {
        match self.local_id.cmp(&self.remote_id) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => self.role == Role::Client,
        }
    }

    /// Seal an application frame for transmission.
    ///
    /// Allowed while ESTABLISHED or ROTATING (the peer accepts either
    /// key generation through the grace window).
    pub fn send_application(
        &mut self,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        if !message_type.is_application() {
            return Err(SessionError::Fatal(format!(
                "{message_type:?} is not an application kind"
            )));
        }
        self.seal_outbound(message_type, payload)
    }

    /// Seal an ERROR frame (e.g. BACKEND_UNAVAILABLE from the relay).
    pub fn send_error(
        &mut self,
        code: ErrorCode,
        detail: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let mut payload = Vec::with_capacity(1 + detail.len());
        payload.push(code.as_byte());
        payload.extend_from_slice(detail);
        self.seal_outbound(MessageType::Error, &payload)
    }

    /// Announce a new server endpoint ahead of a rebind. The old socket
    /// keeps accepting traffic through the grace window.
    pub fn announce_port_rotation(
        &mut self,
        new_addr: SocketAddr,
    ) -> Result<Vec<u8>, SessionError> {
        let mut payload = Vec::new();
        encode_socket_addr(new_addr, &mut payload);
        info!(%new_addr, "announcing port rotation");
        self.seal_outbound(MessageType::PortRotationNotify, &payload)
    }

    pub(crate) fn seal_outbound(
        &mut self,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        match self.phase {
            SessionPhase::Established | SessionPhase::Rotating => {}
            SessionPhase::Closed => return Err(SessionError::Closed),
            other => return Err(SessionError::NotEstablished(other.name())),
        }
        if payload.len() > crate::core::MAX_PAYLOAD_SIZE {
            return Err(SessionError::PayloadTooLarge(payload.len()));
        }
        self.record
            .seal(message_type, payload)
            .map_err(SessionError::from)
    }

    /// Feed a datagram received from the network.
    pub fn handle_datagram(&mut self, datagram: &[u8]) -> SessionOutput {
        if self.phase == SessionPhase::Closed {
            return SessionOutput::default();
        }

        // Late handshake traffic is answered from the cache rather than
        // fed to the record layer, where it could only fail
        // authentication: the client retransmits punches until an ack
        // gets through.
        if let Some(kind) = datagram.get(1).copied() {
            if kind == MessageType::HandshakePunch.as_byte() {
                if let Some(ack) = &self.handshake_ack_cache {
                    debug!("re-sending handshake ack for retransmitted punch");
                    return SessionOutput::datagram(ack.clone());
                }
                return SessionOutput::default();
            }
            if kind == MessageType::HandshakeAck.as_byte() {
                return SessionOutput::default();
            }
        }

        let frame = match self.record.open(datagram) {
            Ok(frame) => frame,
            Err(_) => {
                if self.record.consecutive_auth_failures() >= AUTH_FAIL_CLOSE_THRESHOLD {
                    warn!("closing session: persistent authentication failures");
                    return self.close_with(CloseCause::AuthFailures);
                }
                return SessionOutput::default();
            }
        };
        self.last_peer_activity = Instant::now();
        // The first authenticated session frame proves the ack arrived.
        self.handshake_ack_cache = None;

        match frame.message_type {
            MessageType::KeepalivePing => match self.seal_outbound(MessageType::KeepalivePong, &[])
            {
                Ok(pong) => SessionOutput::datagram(pong),
                Err(_) => SessionOutput::default(),
            },
            MessageType::KeepalivePong => SessionOutput::default(),
            MessageType::KeyRotationPropose => self.handle_rotation_propose(&frame.payload),
            MessageType::KeyRotationAck => self.handle_rotation_ack(&frame.payload),
            MessageType::PortRotationNotify => self.handle_port_rotation(&frame.payload),
            MessageType::Compromised => self.handle_compromised(&frame.payload),
            MessageType::CompromisedAck => self.handle_compromised_ack(),
            MessageType::Error => {
                let code = frame.payload.first().copied().and_then(ErrorCode::from_byte);
                SessionOutput::event(SessionEvent::PeerError {
                    code,
                    detail: frame.payload.get(1..).unwrap_or_default().to_vec(),
                })
            }
            // Handshake kinds were short-circuited above; everything
            // else is an application kind.
            kind if kind.is_application() => SessionOutput::event(SessionEvent::Application {
                message_type: kind,
                payload: frame.payload,
            }),
            _ => SessionOutput::default(),
        }
    }

    fn handle_port_rotation(&mut self, payload: &[u8]) -> SessionOutput {
        let Some((new_addr, _)) = decode_socket_addr(payload) else {
            debug!("dropping malformed port rotation notify");
            return SessionOutput::default();
        };
        info!(%new_addr, "peer rotated its endpoint");
        self.remote = new_addr;
        SessionOutput::event(SessionEvent::PortRotation { new_addr })
    }

    /// Advance the session's timers. The driving loop calls this on a
    /// sub-second interval; sequence numbers and keys are unaffected by
    /// how often it runs.
    pub fn on_tick(&mut self) -> SessionOutput {
        if self.phase == SessionPhase::Closed {
            return SessionOutput::default();
        }
        let now = Instant::now();
        let mut output = SessionOutput::default();

        self.record.expire_old_keys();

        // Fail-secure compromise timeout: zeroize and close even with no
        // acknowledgment.
        if let Some(deadline) = self.compromise_deadline {
            if now >= deadline {
                warn!("compromise acknowledgment timed out; closing fail-secure");
                return self.close_with(CloseCause::Compromise);
            }
            return output;
        }

        if now.duration_since(self.last_peer_activity) >= self.keepalive_timeout {
            warn!("keepalive timed out; closing session");
            return self.close_with(CloseCause::KeepaliveTimeout);
        }

        if now.duration_since(self.last_ping_at) >= self.keepalive_interval {
            self.last_ping_at = now;
            if let Ok(ping) = self.seal_outbound(MessageType::KeepalivePing, &[]) {
                output.datagrams.push(ping);
            }
        }

        if now >= self.next_rotation_at {
            output.push(self.maybe_propose_rotation());
        }

        output
    }

    /// Tear the session down locally.
    pub fn close(&mut self) -> SessionOutput {
        self.close_with(CloseCause::LocalRequest)
    }

    /// Transition to CLOSED, zeroizing all key material on the way.
    pub(crate) fn close_with(&mut self, cause: CloseCause) -> SessionOutput {
        if self.phase == SessionPhase::Closed {
            return SessionOutput::default();
        }
        info!(?cause, "session closed");
        self.phase = SessionPhase::Closed;
        self.pending_rotation = None;
        self.rotation_cache = None;
        self.compromise_deadline = None;
        self.handshake_ack_cache = None;
        self.record.zeroize();
        SessionOutput::event(SessionEvent::Closed { cause })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.record.zeroize();
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{deliver, session_pair};
    use super::*;

    #[tokio::test]
    async fn test_application_roundtrip() {
        let config = ProtocolConfig::default();
        let (mut client, mut server) = session_pair(&config);

        let request = client
            .send_application(MessageType::ChatRequest, b"ping")
            .unwrap();
        let output = server.handle_datagram(&request);
        assert!(matches!(
            &output.events[..],
            [SessionEvent::Application { message_type: MessageType::ChatRequest, payload }]
                if payload == b"ping"
        ));

        let response = server
            .send_application(MessageType::ChatResponse, b"pong")
            .unwrap();
        let output = client.handle_datagram(&response);
        assert!(matches!(
            &output.events[..],
            [SessionEvent::Application { message_type: MessageType::ChatResponse, payload }]
                if payload == b"pong"
        ));
    }

    #[tokio::test]
    async fn test_transport_kind_rejected_as_application() {
        let config = ProtocolConfig::default();
        let (mut client, _) = session_pair(&config);
        assert!(
            client
                .send_application(MessageType::KeepalivePing, b"")
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_keepalive_ping_pong() {
        let config = ProtocolConfig::default();
        let (mut client, mut server) = session_pair(&config);

        let ping = client
            .seal_outbound(MessageType::KeepalivePing, &[])
            .unwrap();
        let output = server.handle_datagram(&ping);
        assert_eq!(output.datagrams.len(), 1);

        let reply = client.handle_datagram(&output.datagrams[0]);
        assert!(reply.datagrams.is_empty());
        assert!(reply.events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_timeout_closes_and_zeroizes() {
        let config = ProtocolConfig::default();
        let (mut client, _) = session_pair(&config);

        tokio::time::advance(config.keepalive_timeout).await;
        let output = client.on_tick();
        assert!(matches!(
            &output.events[..],
            [SessionEvent::Closed {
                cause: CloseCause::KeepaliveTimeout
            }]
        ));
        assert_eq!(client.phase(), SessionPhase::Closed);
        assert!(client.keys_zeroized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_emitted_while_established() {
        let config = ProtocolConfig::default();
        let (mut client, mut server) = session_pair(&config);

        tokio::time::advance(config.keepalive_interval).await;
        let output = client.on_tick();
        assert_eq!(output.datagrams.len(), 1);

        // The pong keeps the client alive.
        let pong = deliver(&mut server, &output);
        assert_eq!(pong.datagrams.len(), 1);
        deliver(&mut client, &pong);
        assert_eq!(client.phase(), SessionPhase::Established);
    }

    #[tokio::test]
    async fn test_replayed_frame_dropped_without_event() {
        let config = ProtocolConfig::default();
        let (mut client, mut server) = session_pair(&config);

        let request = client
            .send_application(MessageType::ChatRequest, b"ping")
            .unwrap();
        assert_eq!(server.handle_datagram(&request).events.len(), 1);

        // Verbatim retransmission: silent drop, counter increments.
        let output = server.handle_datagram(&request);
        assert!(output.events.is_empty());
        assert!(output.datagrams.is_empty());
        assert_eq!(server.stats().replayed, 1);
    }

    #[tokio::test]
    async fn test_persistent_auth_failures_close() {
        let config = ProtocolConfig::default();
        let (mut client, mut server) = session_pair(&config);

        let frame = client
            .send_application(MessageType::ChatRequest, b"x")
            .unwrap();
        let mut closed = false;
        for i in 0..AUTH_FAIL_CLOSE_THRESHOLD + 1 {
            let mut corrupted = frame.clone();
            let last = corrupted.len() - 1;
            corrupted[last] ^= (i as u8).wrapping_add(1);
            let output = server.handle_datagram(&corrupted);
            if matches!(
                output.events.first(),
                Some(SessionEvent::Closed {
                    cause: CloseCause::AuthFailures
                })
            ) {
                closed = true;
                break;
            }
        }
        assert!(closed);
        assert!(server.keys_zeroized());
    }

    #[tokio::test]
    async fn test_port_rotation_notify() {
        let config = ProtocolConfig::default();
        let (mut client, mut server) = session_pair(&config);

        let new_addr: SocketAddr = "127.0.0.1:49400".parse().unwrap();
        let notify = server.announce_port_rotation(new_addr).unwrap();
        let output = client.handle_datagram(&notify);

        assert!(matches!(
            &output.events[..],
            [SessionEvent::PortRotation { new_addr: a }] if *a == new_addr
        ));
        assert_eq!(client.remote(), new_addr);

        // Keys and sequences are unaffected: traffic continues.
        let request = client
            .send_application(MessageType::ChatRequest, b"after rotation")
            .unwrap();
        assert_eq!(server.handle_datagram(&request).events.len(), 1);
    }

    #[tokio::test]
    async fn test_peer_error_event() {
        let config = ProtocolConfig::default();
        let (mut client, mut server) = session_pair(&config);

        let error = server
            .send_error(ErrorCode::BackendUnavailable, b"")
            .unwrap();
        let output = client.handle_datagram(&error);
        assert!(matches!(
            &output.events[..],
            [SessionEvent::PeerError {
                code: Some(ErrorCode::BackendUnavailable),
                ..
            }]
        ));
        // The session stays open.
        assert_eq!(client.phase(), SessionPhase::Established);
    }

    #[tokio::test]
    async fn test_close_zeroizes() {
        let config = ProtocolConfig::default();
        let (mut client, _) = session_pair(&config);

        let output = client.close();
        assert!(matches!(
            &output.events[..],
            [SessionEvent::Closed {
                cause: CloseCause::LocalRequest
            }]
        ));
        assert!(client.keys_zeroized());
        assert!(
            client
                .send_application(MessageType::ChatRequest, b"x")
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_retransmitted_punch_answered_from_cache() {
        let config = ProtocolConfig::default();
        let secret = testutil::SECRET;
        let mut initiator = HandshakeInitiator::new(&secret, 1_700_000_000).unwrap();
        let mut responder = HandshakeResponder::new(&secret).unwrap();

        let punch = initiator.punch_frame().unwrap();
        let (ack, server_result) = responder
            .handle_datagram(&punch, "192.0.2.10:40000".parse().unwrap())
            .unwrap()
            .unwrap();
        let mut server = Session::establish(server_result, Role::Server, &config);

        // The ack was lost; the client punches again. The server answers
        // with the identical cached ack instead of counting an
        // authentication failure.
        let retransmit = initiator.punch_frame().unwrap();
        let output = server.handle_datagram(&retransmit);
        assert_eq!(output.datagrams, vec![ack.clone()]);
        assert_eq!(server.stats().auth_failed, 0);

        // Once the client speaks under session keys, the cache clears.
        let client_result = initiator
            .handle_datagram(&ack, "198.51.100.20:49300".parse().unwrap())
            .unwrap()
            .unwrap();
        let mut client = Session::establish(client_result, Role::Client, &config);
        let request = client
            .send_application(MessageType::ChatRequest, b"hi")
            .unwrap();
        server.handle_datagram(&request);

        let late_punch = initiator.punch_frame().unwrap();
        let output = server.handle_datagram(&late_punch);
        assert!(output.datagrams.is_empty());
    }
}
