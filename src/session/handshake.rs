//! The hole-punch handshake.
//!
//! The client sends HANDSHAKE_PUNCH frames toward the artifact's server
//! endpoint at a fixed interval; the server answers the first
//! authenticated punch with HANDSHAKE_ACK and records the observed
//! source as the session's remote endpoint. Both frames are sealed under
//! keys derived from the artifact's shared secret alone - no plaintext
//! identity is ever sent.
//!
//! Punch payload: `client_id (8, BE) || handshake_time (8, BE)`.
//! Ack payload:   `server_id (8, BE) || handshake_time echo (8, BE)`.
//!
//! The echoed timestamp binds an ack to the punch attempt that caused
//! it. After the exchange both sides hold (shared_secret, client_id,
//! server_id, handshake_time) and derive the same session key schedule.

use std::net::SocketAddr;

use tracing::debug;
use zeroize::Zeroize;

use crate::core::{CONNECTION_ID_SIZE, CryptoError, FRAME_HEADER_SIZE, SHARED_SECRET_SIZE};
use crate::crypto::{
    ConnectionId, HandshakeKeys, Role, SessionKeys, derive_handshake_keys, derive_session_keys,
    open, seal,
};
use crate::record::{FrameHeader, MessageType, nonce_from_sequence};

/// Punch/ack payload size: connection id plus timestamp.
const HANDSHAKE_PAYLOAD_SIZE: usize = CONNECTION_ID_SIZE + 8;

/// Everything a completed handshake yields.
#[derive(Debug)]
pub struct HandshakeResult {
    /// This endpoint's connection identifier.
    pub local_id: ConnectionId,
    /// The peer's connection identifier.
    pub remote_id: ConnectionId,
    /// The agreed session key schedule.
    pub keys: SessionKeys,
    /// The verified remote endpoint (observed source address).
    pub remote: SocketAddr,
    /// Handshake timestamp, seconds since the UNIX epoch.
    pub handshake_time: u64,
    /// Server side only: the ack frame bytes, re-sent verbatim when the
    /// client retransmits a punch because the first ack was lost.
    pub ack_cache: Option<Vec<u8>>,
}

fn seal_handshake_frame(
    keys: &HandshakeKeys,
    message_type: MessageType,
    sequence: u64,
    local_id: ConnectionId,
    time: u64,
) -> Result<Vec<u8>, CryptoError> {
    let mut payload = [0u8; HANDSHAKE_PAYLOAD_SIZE];
    payload[..CONNECTION_ID_SIZE].copy_from_slice(&local_id.to_bytes());
    payload[CONNECTION_ID_SIZE..].copy_from_slice(&time.to_be_bytes());

    let header = FrameHeader::new(message_type, sequence);
    let header_bytes = header.to_bytes();
    let nonce = nonce_from_sequence(sequence);
    let sealed = seal(keys.tx.as_bytes(), &nonce, &header_bytes, &payload)?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + sealed.len());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(&sealed);
    Ok(frame)
}

fn open_handshake_frame(
    keys: &HandshakeKeys,
    expected_type: MessageType,
    datagram: &[u8],
) -> Option<(ConnectionId, u64)> {
    let header = FrameHeader::parse(datagram).ok()?;
    if header.message_type != expected_type {
        return None;
    }
    let nonce = nonce_from_sequence(header.sequence);
    let payload = open(
        keys.rx.as_bytes(),
        &nonce,
        &datagram[..FRAME_HEADER_SIZE],
        &datagram[FRAME_HEADER_SIZE..],
    )
    .ok()?;
    if payload.len() != HANDSHAKE_PAYLOAD_SIZE {
        return None;
    }

    let mut id = [0u8; CONNECTION_ID_SIZE];
    id.copy_from_slice(&payload[..CONNECTION_ID_SIZE]);
    let mut time = [0u8; 8];
    time.copy_from_slice(&payload[CONNECTION_ID_SIZE..]);
    Some((ConnectionId::from_bytes(id), u64::from_be_bytes(time)))
}

/// Client side of the handshake.
pub struct HandshakeInitiator {
    keys: HandshakeKeys,
    shared_secret: [u8; SHARED_SECRET_SIZE],
    local_id: ConnectionId,
    handshake_time: u64,
    tx_seq: u64,
}

impl HandshakeInitiator {
    /// Prepare a handshake attempt at the given UNIX time.
    pub fn new(
        shared_secret: &[u8; SHARED_SECRET_SIZE],
        now: u64,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            keys: derive_handshake_keys(shared_secret, Role::Client)?,
            shared_secret: *shared_secret,
            local_id: ConnectionId::generate()?,
            handshake_time: now,
            tx_seq: 0,
        })
    }

    /// This endpoint's connection identifier.
    pub fn local_id(&self) -> ConnectionId {
        self.local_id
    }

    /// Produce the next HANDSHAKE_PUNCH frame. Each call consumes a
    /// sequence number, so retransmissions are distinct frames.
    pub fn punch_frame(&mut self) -> Result<Vec<u8>, CryptoError> {
        let sequence = self.tx_seq;
        self.tx_seq += 1;
        seal_handshake_frame(
            &self.keys,
            MessageType::HandshakePunch,
            sequence,
            self.local_id,
            self.handshake_time,
        )
    }

    /// Feed a received datagram.
    ///
    /// Returns the handshake result on the first AEAD-verifying
    /// HANDSHAKE_ACK whose echoed timestamp matches this attempt; the
    /// responder's source address becomes the remote endpoint. Anything
    /// else is dropped. If multiple sources answer, the first verifying
    /// one wins.
    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
    ) -> Result<Option<HandshakeResult>, CryptoError> {
        let Some((server_id, echoed)) =
            open_handshake_frame(&self.keys, MessageType::HandshakeAck, datagram)
        else {
            return Ok(None);
        };
        if echoed != self.handshake_time {
            debug!("dropping handshake ack with stale timestamp echo");
            return Ok(None);
        }

        let keys = derive_session_keys(
            &self.shared_secret,
            self.local_id,
            server_id,
            self.handshake_time,
            Role::Client,
        )?;
        Ok(Some(HandshakeResult {
            local_id: self.local_id,
            remote_id: server_id,
            keys,
            remote: from,
            handshake_time: self.handshake_time,
            ack_cache: None,
        }))
    }
}

impl Drop for HandshakeInitiator {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

/// Server side of the handshake.
pub struct HandshakeResponder {
    keys: HandshakeKeys,
    shared_secret: [u8; SHARED_SECRET_SIZE],
    local_id: ConnectionId,
    tx_seq: u64,
}

impl HandshakeResponder {
    /// Prepare to answer punches for the artifact holding
    /// `shared_secret`.
    pub fn new(shared_secret: &[u8; SHARED_SECRET_SIZE]) -> Result<Self, CryptoError> {
        Ok(Self {
            keys: derive_handshake_keys(shared_secret, Role::Server)?,
            shared_secret: *shared_secret,
            local_id: ConnectionId::generate()?,
            tx_seq: 0,
        })
    }

    /// This endpoint's connection identifier.
    pub fn local_id(&self) -> ConnectionId {
        self.local_id
    }

    /// Feed a received datagram.
    ///
    /// On the first authenticated HANDSHAKE_PUNCH, returns the ack frame
    /// to send back to the observed source together with the handshake
    /// result. Unauthenticated datagrams are dropped silently.
    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
    ) -> Result<Option<(Vec<u8>, HandshakeResult)>, CryptoError> {
        let Some((client_id, handshake_time)) =
            open_handshake_frame(&self.keys, MessageType::HandshakePunch, datagram)
        else {
            return Ok(None);
        };

        let sequence = self.tx_seq;
        self.tx_seq += 1;
        let ack = seal_handshake_frame(
            &self.keys,
            MessageType::HandshakeAck,
            sequence,
            self.local_id,
            handshake_time,
        )?;

        let keys = derive_session_keys(
            &self.shared_secret,
            client_id,
            self.local_id,
            handshake_time,
            Role::Server,
        )?;
        debug!(%from, "answering authenticated handshake punch");
        Ok(Some((
            ack.clone(),
            HandshakeResult {
                local_id: self.local_id,
                remote_id: client_id,
                keys,
                remote: from,
                handshake_time,
                ack_cache: Some(ack),
            },
        )))
    }
}

impl Drop for HandshakeResponder {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; SHARED_SECRET_SIZE] = [0x22; SHARED_SECRET_SIZE];
    const CLIENT_ADDR: &str = "192.0.2.10:40000";
    const SERVER_ADDR: &str = "198.51.100.20:49300";

    fn run_handshake() -> (HandshakeResult, HandshakeResult) {
        let mut initiator = HandshakeInitiator::new(&SECRET, 1_700_000_000).unwrap();
        let mut responder = HandshakeResponder::new(&SECRET).unwrap();

        let punch = initiator.punch_frame().unwrap();
        let (ack, server_result) = responder
            .handle_datagram(&punch, CLIENT_ADDR.parse().unwrap())
            .unwrap()
            .expect("server answers first authenticated punch");
        let client_result = initiator
            .handle_datagram(&ack, SERVER_ADDR.parse().unwrap())
            .unwrap()
            .expect("client accepts the ack");
        (client_result, server_result)
    }

    #[test]
    fn test_handshake_agrees_on_keys_and_ids() {
        let (client, server) = run_handshake();

        assert_eq!(client.local_id, server.remote_id);
        assert_eq!(client.remote_id, server.local_id);
        assert_eq!(client.handshake_time, server.handshake_time);

        assert_eq!(client.keys.tx.as_bytes(), server.keys.rx.as_bytes());
        assert_eq!(client.keys.rx.as_bytes(), server.keys.tx.as_bytes());
        assert_eq!(client.keys.mac.as_bytes(), server.keys.mac.as_bytes());
    }

    #[test]
    fn test_both_sides_record_observed_endpoints() {
        let (client, server) = run_handshake();
        assert_eq!(server.remote, CLIENT_ADDR.parse().unwrap());
        assert_eq!(client.remote, SERVER_ADDR.parse().unwrap());
        assert!(server.ack_cache.is_some());
        assert!(client.ack_cache.is_none());
    }

    #[test]
    fn test_wrong_secret_punch_ignored() {
        let mut initiator = HandshakeInitiator::new(&[0x33; 32], 1_700_000_000).unwrap();
        let mut responder = HandshakeResponder::new(&SECRET).unwrap();

        let punch = initiator.punch_frame().unwrap();
        let answer = responder
            .handle_datagram(&punch, CLIENT_ADDR.parse().unwrap())
            .unwrap();
        assert!(answer.is_none());
    }

    #[test]
    fn test_corrupted_punch_ignored() {
        let mut initiator = HandshakeInitiator::new(&SECRET, 1_700_000_000).unwrap();
        let mut responder = HandshakeResponder::new(&SECRET).unwrap();

        let mut punch = initiator.punch_frame().unwrap();
        let last = punch.len() - 1;
        punch[last] ^= 0x01;
        assert!(
            responder
                .handle_datagram(&punch, CLIENT_ADDR.parse().unwrap())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_client_ignores_forged_ack() {
        let mut initiator = HandshakeInitiator::new(&SECRET, 1_700_000_000).unwrap();
        let mut forger = HandshakeResponder::new(&[0x44; 32]).unwrap();

        let punch = initiator.punch_frame().unwrap();
        // The forger cannot authenticate the punch, so fabricate an ack
        // under its own (wrong) keys.
        assert!(
            forger
                .handle_datagram(&punch, CLIENT_ADDR.parse().unwrap())
                .unwrap()
                .is_none()
        );
        let forged = seal_handshake_frame(
            &derive_handshake_keys(&[0x44; 32], Role::Server).unwrap(),
            MessageType::HandshakeAck,
            0,
            ConnectionId::from_u64(9),
            1_700_000_000,
        )
        .unwrap();
        assert!(
            initiator
                .handle_datagram(&forged, SERVER_ADDR.parse().unwrap())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_stale_timestamp_echo_rejected() {
        let mut initiator = HandshakeInitiator::new(&SECRET, 1_700_000_000).unwrap();
        let mut responder = HandshakeResponder::new(&SECRET).unwrap();

        // An ack for a different attempt (different timestamp) must not
        // complete this one.
        let mut old_initiator = HandshakeInitiator::new(&SECRET, 1_600_000_000).unwrap();
        let old_punch = old_initiator.punch_frame().unwrap();
        let (old_ack, _) = responder
            .handle_datagram(&old_punch, CLIENT_ADDR.parse().unwrap())
            .unwrap()
            .unwrap();

        assert!(
            initiator
                .handle_datagram(&old_ack, SERVER_ADDR.parse().unwrap())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_retransmitted_punches_are_distinct_frames() {
        let mut initiator = HandshakeInitiator::new(&SECRET, 1_700_000_000).unwrap();
        let first = initiator.punch_frame().unwrap();
        let second = initiator.punch_frame().unwrap();
        assert_ne!(first, second);

        // Both authenticate on the responder.
        let mut responder = HandshakeResponder::new(&SECRET).unwrap();
        assert!(
            responder
                .handle_datagram(&second, CLIENT_ADDR.parse().unwrap())
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_punch_is_not_a_valid_ack() {
        // A reflected punch must never complete the client handshake.
        let mut initiator = HandshakeInitiator::new(&SECRET, 1_700_000_000).unwrap();
        let punch = initiator.punch_frame().unwrap();
        assert!(
            initiator
                .handle_datagram(&punch, SERVER_ADDR.parse().unwrap())
                .unwrap()
                .is_none()
        );
    }
}
