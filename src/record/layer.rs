//! AEAD seal/open engine over the frame codec.
//!
//! One `RecordLayer` per session. The send path is single-writer: the
//! transmit counter increments once per sealed frame and sequences are
//! strictly monotonic. The receive path verifies the header, opens under
//! the current key generation (falling back to the retained old
//! generation during the rotation grace window), then runs the replay
//! check and advances the window.

use std::time::Duration;

use tracing::debug;

use crate::core::{CryptoError, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE, RecordDrop};
use crate::crypto::{OldKeyRetention, SessionKey, SessionKeys, open, seal};

use super::frame::{FrameHeader, MessageType, nonce_from_sequence};
use super::replay::ReplayWindow;

/// Operational counters for one session.
///
/// Silent drops are invisible on the wire by design; these counters are
/// the only way an operator sees them.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordStats {
    /// Frames sealed and handed to the socket.
    pub sealed: u64,
    /// Frames authenticated and delivered.
    pub opened: u64,
    /// Frames dropped for AEAD failure.
    pub auth_failed: u64,
    /// Frames dropped by the replay window.
    pub replayed: u64,
    /// Frames dropped before decryption (length, version, opcode).
    pub malformed: u64,
}

/// A successfully opened frame.
#[derive(Debug, PartialEq)]
pub struct OpenedFrame {
    /// The authenticated message type.
    pub message_type: MessageType,
    /// The sender's sequence number.
    pub sequence: u64,
    /// The decrypted payload.
    pub payload: Vec<u8>,
}

/// The per-session record layer.
pub struct RecordLayer {
    keys: SessionKeys,
    old_keys: OldKeyRetention,
    replay: ReplayWindow,
    tx_counter: u64,
    consecutive_auth_failures: u32,
    stats: RecordStats,
}

impl RecordLayer {
    /// Create a record layer around an installed key generation.
    pub fn new(keys: SessionKeys, grace: Duration) -> Self {
        Self {
            keys,
            old_keys: OldKeyRetention::new(grace),
            replay: ReplayWindow::new(),
            tx_counter: 0,
            consecutive_auth_failures: 0,
            stats: RecordStats::default(),
        }
    }

    /// Seal a payload into a wire frame, consuming the next sequence
    /// number.
    pub fn seal(
        &mut self,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CryptoError::SealFailure);
        }
        if self.tx_counter == u64::MAX {
            return Err(CryptoError::CounterExhausted);
        }
        let sequence = self.tx_counter;
        let header = FrameHeader::new(message_type, sequence);
        let header_bytes = header.to_bytes();
        let nonce = nonce_from_sequence(sequence);

        let sealed = seal(self.keys.tx.as_bytes(), &nonce, &header_bytes, payload)?;
        self.tx_counter += 1;
        self.stats.sealed += 1;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + sealed.len());
        frame.extend_from_slice(&header_bytes);
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Open a received datagram.
    ///
    /// Returns the drop reason on failure; the caller discards the frame
    /// without replying. Delivery is exactly-once within the replay
    /// window but unordered.
    pub fn open(&mut self, datagram: &[u8]) -> Result<OpenedFrame, RecordDrop> {
        let header = match FrameHeader::parse(datagram) {
            Ok(header) => header,
            Err(reason) => {
                self.stats.malformed += 1;
                debug!(?reason, "dropping malformed frame");
                return Err(reason);
            }
        };

        let header_bytes = &datagram[..FRAME_HEADER_SIZE];
        let ciphertext = &datagram[FRAME_HEADER_SIZE..];
        let nonce = nonce_from_sequence(header.sequence);

        self.old_keys.clear_if_expired();
        let payload = match open(self.keys.rx.as_bytes(), &nonce, header_bytes, ciphertext) {
            Ok(payload) => payload,
            Err(_) => match self
                .old_keys
                .old_rx()
                .and_then(|old| open(old.as_bytes(), &nonce, header_bytes, ciphertext).ok())
            {
                Some(payload) => payload,
                None => {
                    self.stats.auth_failed += 1;
                    self.consecutive_auth_failures += 1;
                    debug!(
                        sequence = header.sequence,
                        consecutive = self.consecutive_auth_failures,
                        "dropping frame: authentication failed"
                    );
                    return Err(RecordDrop::AuthFailed);
                }
            },
        };
        self.consecutive_auth_failures = 0;

        // Replay check runs only after authentication so forged frames
        // cannot poison the window; acceptance and window advance are one
        // step.
        if let Err(reason) = self.replay.check_and_update(header.sequence) {
            self.stats.replayed += 1;
            debug!(sequence = header.sequence, "dropping replayed frame");
            return Err(reason);
        }

        self.stats.opened += 1;
        Ok(OpenedFrame {
            message_type: header.message_type,
            sequence: header.sequence,
            payload,
        })
    }

    /// Install a new key generation.
    ///
    /// The outgoing generation's receive key is retained for the grace
    /// window; the transmit side switches immediately. Sequence counters
    /// and the replay window carry over, so nonces stay unique per key
    /// and the replay invariant holds across rotations.
    pub fn install(&mut self, new_keys: SessionKeys) {
        let mut outgoing = std::mem::replace(&mut self.keys, new_keys);
        self.old_keys.retain(outgoing.rx.clone());
        outgoing.zeroize_all();
    }

    /// The shared MAC key of the current generation.
    pub fn mac_key(&self) -> &SessionKey {
        &self.keys.mac
    }

    /// The rotation seed of the current generation.
    pub fn next_seed(&self) -> &SessionKey {
        &self.keys.next_seed
    }

    /// Zeroize the current generation and drop any retained old key.
    pub fn zeroize(&mut self) {
        self.keys.zeroize_all();
        self.old_keys.clear();
    }

    /// Whether every installed key is the zero byte-string.
    pub fn is_zeroized(&self) -> bool {
        self.keys.is_zeroized() && self.old_keys.old_rx().is_none()
    }

    /// Drop the retained old generation if its grace expired.
    pub fn expire_old_keys(&mut self) {
        self.old_keys.clear_if_expired();
    }

    /// Consecutive AEAD failures since the last successful open.
    pub fn consecutive_auth_failures(&self) -> u32 {
        self.consecutive_auth_failures
    }

    /// Operational counters.
    pub fn stats(&self) -> RecordStats {
        self.stats
    }

    /// Next sequence number the send path will use.
    pub fn tx_sequence(&self) -> u64 {
        self.tx_counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{GRACE_INTERVAL, KEY_SIZE};
    use crate::crypto::{ConnectionId, Role, derive_rotated_keys, derive_session_keys};

    fn layer_pair() -> (RecordLayer, RecordLayer) {
        let secret = [0x22u8; KEY_SIZE];
        let client_id = ConnectionId::from_u64(1);
        let server_id = ConnectionId::from_u64(2);
        let client =
            derive_session_keys(&secret, client_id, server_id, 1_700_000_000, Role::Client)
                .unwrap();
        let server =
            derive_session_keys(&secret, client_id, server_id, 1_700_000_000, Role::Server)
                .unwrap();
        (
            RecordLayer::new(client, GRACE_INTERVAL),
            RecordLayer::new(server, GRACE_INTERVAL),
        )
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (mut client, mut server) = layer_pair();

        let frame = client.seal(MessageType::ChatRequest, b"ping").unwrap();
        let opened = server.open(&frame).unwrap();
        assert_eq!(opened.message_type, MessageType::ChatRequest);
        assert_eq!(opened.payload, b"ping");
        assert_eq!(opened.sequence, 0);

        let reply = server.seal(MessageType::ChatResponse, b"pong").unwrap();
        let opened = client.open(&reply).unwrap();
        assert_eq!(opened.message_type, MessageType::ChatResponse);
        assert_eq!(opened.payload, b"pong");
    }

    #[test]
    fn test_sequences_monotonic() {
        let (mut client, _) = layer_pair();
        for expected in 0..10 {
            assert_eq!(client.tx_sequence(), expected);
            client.seal(MessageType::KeepalivePing, b"").unwrap();
        }
    }

    #[test]
    fn test_exact_replay_rejected() {
        let (mut client, mut server) = layer_pair();

        let frame = client.seal(MessageType::ChatRequest, b"ping").unwrap();
        assert!(server.open(&frame).is_ok());

        // Verbatim retransmission of the same frame bytes.
        assert_eq!(server.open(&frame), Err(RecordDrop::Replayed));
        assert_eq!(server.stats().replayed, 1);
        assert_eq!(server.stats().opened, 1);
    }

    #[test]
    fn test_reordered_frames_all_deliver_once() {
        let (mut client, mut server) = layer_pair();

        let frames: Vec<_> = (0..5)
            .map(|i| client.seal(MessageType::ChatRequest, &[i]).unwrap())
            .collect();

        // Deliver in reverse order.
        for frame in frames.iter().rev() {
            assert!(server.open(frame).is_ok());
        }
        // Every second delivery is a replay.
        for frame in &frames {
            assert_eq!(server.open(frame), Err(RecordDrop::Replayed));
        }
    }

    #[test]
    fn test_corrupted_frames_rejected() {
        let (mut client, mut server) = layer_pair();
        let frame = client.seal(MessageType::ChatRequest, b"payload").unwrap();

        // Flip a bit in the ciphertext, the tag, and the header.
        for index in [FRAME_HEADER_SIZE, frame.len() - 1, 2] {
            let mut corrupted = frame.clone();
            corrupted[index] ^= 0x01;
            assert_eq!(server.open(&corrupted), Err(RecordDrop::AuthFailed));
        }
        // The intact frame still opens.
        assert!(server.open(&frame).is_ok());
        assert_eq!(server.consecutive_auth_failures(), 0);
    }

    #[test]
    fn test_consecutive_auth_failures_count() {
        let (mut client, mut server) = layer_pair();
        let frame = client.seal(MessageType::ChatRequest, b"x").unwrap();

        for i in 1..=5u32 {
            let mut corrupted = frame.clone();
            corrupted[FRAME_HEADER_SIZE] ^= i as u8;
            assert_eq!(server.open(&corrupted), Err(RecordDrop::AuthFailed));
            assert_eq!(server.consecutive_auth_failures(), i);
        }
        assert!(server.open(&frame).is_ok());
        assert_eq!(server.consecutive_auth_failures(), 0);
    }

    #[test]
    fn test_rotation_grace_accepts_both_generations() {
        let (mut client, mut server) = layer_pair();

        let old_frame = client.seal(MessageType::ChatRequest, b"old").unwrap();

        let contrib_a = [0x0A; 32];
        let contrib_b = [0x0B; 32];
        let client_next =
            derive_rotated_keys(client.next_seed(), &contrib_a, &contrib_b, Role::Client).unwrap();
        let server_next =
            derive_rotated_keys(server.next_seed(), &contrib_a, &contrib_b, Role::Server).unwrap();
        client.install(client_next);
        server.install(server_next);

        // A frame sealed under the new generation opens.
        let new_frame = client.seal(MessageType::ChatRequest, b"new").unwrap();
        assert_eq!(server.open(&new_frame).unwrap().payload, b"new");

        // The in-flight old-generation frame still opens within grace.
        assert_eq!(server.open(&old_frame).unwrap().payload, b"old");
    }

    #[test]
    fn test_old_keys_rejected_after_grace() {
        let secret = [0x22u8; KEY_SIZE];
        let ids = (ConnectionId::from_u64(1), ConnectionId::from_u64(2));
        let client_keys =
            derive_session_keys(&secret, ids.0, ids.1, 100, Role::Client).unwrap();
        let server_keys =
            derive_session_keys(&secret, ids.0, ids.1, 100, Role::Server).unwrap();
        let mut client = RecordLayer::new(client_keys, Duration::ZERO);
        let mut server = RecordLayer::new(server_keys, Duration::ZERO);

        let old_frame = client.seal(MessageType::ChatRequest, b"old").unwrap();

        let contribs = ([0x0A; 32], [0x0B; 32]);
        let client_next =
            derive_rotated_keys(client.next_seed(), &contribs.0, &contribs.1, Role::Client)
                .unwrap();
        let server_next =
            derive_rotated_keys(server.next_seed(), &contribs.0, &contribs.1, Role::Server)
                .unwrap();
        client.install(client_next);
        server.install(server_next);

        // Zero grace: the old generation is gone immediately.
        assert_eq!(server.open(&old_frame), Err(RecordDrop::AuthFailed));
    }

    #[test]
    fn test_new_keys_reject_frames_sealed_under_old() {
        let (mut client, server) = layer_pair();

        let contribs = ([0x0A; 32], [0x0B; 32]);
        let server_next =
            derive_rotated_keys(server.next_seed(), &contribs.0, &contribs.1, Role::Server)
                .unwrap();
        // A receiver holding only the new generation rejects frames
        // sealed under the old one.
        let mut fresh_server = RecordLayer::new(server_next, Duration::ZERO);

        let frame = client.seal(MessageType::ChatRequest, b"stale").unwrap();
        assert_eq!(fresh_server.open(&frame), Err(RecordDrop::AuthFailed));
    }

    #[test]
    fn test_zeroize() {
        let (mut client, _) = layer_pair();
        client.seal(MessageType::ChatRequest, b"x").unwrap();
        client.zeroize();
        assert!(client.is_zeroized());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let (mut client, _) = layer_pair();
        let huge = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(client.seal(MessageType::FileUploadChunk, &huge).is_err());
    }
}
