//! The compromise sub-protocol.
//!
//! Either endpoint can declare the session compromised. The COMPROMISED
//! frame carries the reason, a timestamp, and an HMAC over
//! `timestamp || sender_connection_id` under the shared MAC key, so a
//! peer that somehow forged a frame through the AEAD still cannot force
//! a teardown. The receiver acknowledges and atomically zeroizes its
//! keys and closes; the trigger side does the same on the ack or after a
//! 10-second timeout (fail-secure). Artifact destruction and
//! regeneration are the owning endpoint's responsibility, driven by the
//! emitted events.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::{COMPROMISE_ACK_TIMEOUT, CompromiseReason};
use crate::crypto::{hmac_sha256, hmac_verify};
use crate::record::MessageType;

use super::{CloseCause, Session, SessionEvent, SessionOutput, SessionPhase};

/// COMPROMISED payload: reason (1) || timestamp (8, BE) || HMAC (32).
const COMPROMISE_PAYLOAD_SIZE: usize = 1 + 8 + 32;

fn compromise_mac_input(timestamp: u64, sender_id: crate::crypto::ConnectionId) -> [u8; 16] {
    let mut input = [0u8; 16];
    input[..8].copy_from_slice(&timestamp.to_be_bytes());
    input[8..].copy_from_slice(&sender_id.to_bytes());
    input
}

impl Session {
    /// Declare the session compromised.
    ///
    /// Sends COMPROMISED under the current keys and waits up to the ack
    /// timeout before closing unilaterally. Keys stay installed until
    /// closure so the acknowledgment can still be authenticated.
    pub fn trigger_compromise(&mut self, reason: CompromiseReason) -> SessionOutput {
        match self.phase {
            SessionPhase::Established | SessionPhase::Rotating => {}
            _ => return SessionOutput::default(),
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mac = hmac_sha256(
            self.record.mac_key().as_bytes(),
            &compromise_mac_input(timestamp, self.local_id),
        );

        let mut payload = Vec::with_capacity(COMPROMISE_PAYLOAD_SIZE);
        payload.push(reason.as_byte());
        payload.extend_from_slice(&timestamp.to_be_bytes());
        payload.extend_from_slice(&mac);

        match self.seal_outbound(MessageType::Compromised, &payload) {
            Ok(frame) => {
                warn!(?reason, "declared session compromised");
                self.phase = SessionPhase::CompromisedPendingAck;
                self.compromise_deadline = Some(Instant::now() + COMPROMISE_ACK_TIMEOUT);
                SessionOutput::datagram(frame)
            }
            // Fail-secure: if the frame cannot even be sealed, close
            // immediately.
            Err(_) => self.close_with(CloseCause::Compromise),
        }
    }

    /// Handle a received COMPROMISED frame.
    pub(crate) fn handle_compromised(&mut self, payload: &[u8]) -> SessionOutput {
        if payload.len() != COMPROMISE_PAYLOAD_SIZE {
            debug!("dropping malformed compromised frame");
            return SessionOutput::default();
        }
        let reason = CompromiseReason::from_byte(payload[0]);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&payload[1..9]);
        let timestamp = u64::from_be_bytes(timestamp);
        let mac = &payload[9..];

        if !hmac_verify(
            self.record.mac_key().as_bytes(),
            &compromise_mac_input(timestamp, self.remote_id),
            mac,
        ) {
            debug!("dropping compromised frame with bad mac");
            return SessionOutput::default();
        }

        warn!(?reason, "peer declared session compromised");
        let ack = self.seal_outbound(MessageType::CompromisedAck, &[]).ok();

        // Acknowledge, then zeroize and close in one step.
        let mut output = SessionOutput::default();
        if let Some(ack) = ack {
            output.datagrams.push(ack);
        }
        output.events.push(SessionEvent::Compromised { reason });
        output.push(self.close_with(CloseCause::Compromise));
        output
    }

    /// Handle COMPROMISED_ACK (trigger side).
    pub(crate) fn handle_compromised_ack(&mut self) -> SessionOutput {
        if self.phase != SessionPhase::CompromisedPendingAck {
            return SessionOutput::default();
        }
        self.close_with(CloseCause::Compromise)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{deliver, session_pair};
    use super::*;
    use crate::core::{COMPROMISE_ACK_TIMEOUT, ProtocolConfig};

    #[tokio::test]
    async fn test_compromise_protocol_completes() {
        let config = ProtocolConfig::default();
        let (mut client, mut server) = session_pair(&config);

        let output = client.trigger_compromise(CompromiseReason::Operator);
        assert_eq!(output.datagrams.len(), 1);
        assert_eq!(client.phase(), SessionPhase::CompromisedPendingAck);
        // Keys stay installed until the ack arrives.
        assert!(!client.keys_zeroized());

        let server_out = deliver(&mut server, &output);
        assert!(matches!(
            server_out.events.first(),
            Some(SessionEvent::Compromised {
                reason: CompromiseReason::Operator
            })
        ));
        assert_eq!(server.phase(), SessionPhase::Closed);
        assert!(server.keys_zeroized());

        let client_out = deliver(&mut client, &server_out);
        assert!(matches!(
            client_out.events.first(),
            Some(SessionEvent::Closed {
                cause: CloseCause::Compromise
            })
        ));
        assert_eq!(client.phase(), SessionPhase::Closed);
        assert!(client.keys_zeroized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_compromise_timeout_fail_secure() {
        let config = ProtocolConfig::default();
        let (mut client, _server) = session_pair(&config);

        let output = client.trigger_compromise(CompromiseReason::ArtifactLeak);
        assert_eq!(output.datagrams.len(), 1);

        // No ack ever arrives; the deadline forces closure anyway.
        tokio::time::advance(COMPROMISE_ACK_TIMEOUT).await;
        let output = client.on_tick();
        assert!(matches!(
            output.events.first(),
            Some(SessionEvent::Closed {
                cause: CloseCause::Compromise
            })
        ));
        assert!(client.keys_zeroized());
    }

    #[tokio::test]
    async fn test_forged_compromise_mac_ignored() {
        let config = ProtocolConfig::default();
        let (mut client, mut server) = session_pair(&config);

        // Sealed correctly but with a garbage MAC: the frame
        // authenticates at the record layer yet fails the compromise
        // check, so the session survives.
        let mut payload = vec![CompromiseReason::Operator.as_byte()];
        payload.extend_from_slice(&1_700_000_123u64.to_be_bytes());
        payload.extend_from_slice(&[0u8; 32]);
        let frame = client
            .seal_outbound(MessageType::Compromised, &payload)
            .unwrap();

        let output = server.handle_datagram(&frame);
        assert!(output.events.is_empty());
        assert_eq!(server.phase(), SessionPhase::Established);
        assert!(!server.keys_zeroized());
    }

    #[tokio::test]
    async fn test_stray_compromised_ack_ignored() {
        let config = ProtocolConfig::default();
        let (mut client, mut server) = session_pair(&config);

        let ack = client
            .seal_outbound(MessageType::CompromisedAck, &[])
            .unwrap();
        let output = server.handle_datagram(&ack);
        assert!(output.events.is_empty());
        assert_eq!(server.phase(), SessionPhase::Established);
    }

    #[tokio::test]
    async fn test_no_frames_open_after_compromise() {
        let config = ProtocolConfig::default();
        let (mut client, mut server) = session_pair(&config);

        let request = client
            .send_application(MessageType::ChatRequest, b"before")
            .unwrap();

        let output = client.trigger_compromise(CompromiseReason::Operator);
        deliver(&mut server, &output);
        assert!(server.keys_zeroized());

        // A frame sealed before the compromise no longer opens: the
        // zeroized session ignores it entirely.
        let late = server.handle_datagram(&request);
        assert!(late.events.is_empty());
    }
}
