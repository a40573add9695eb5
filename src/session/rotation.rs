//! The key rotation sub-protocol.
//!
//! When the rotation timer fires, the endpoint with the lower connection
//! identifier proposes by sending KEY_ROTATION_PROPOSE carrying 32 bytes
//! of fresh entropy. The peer answers KEY_ROTATION_ACK carrying its own
//! contribution, sealed under the outgoing generation, and only then
//! installs the new keys (a receiver never installs before
//! acknowledging). The proposer installs on receiving the ack. Old keys
//! keep opening in-flight frames through the grace window, after which
//! they are zeroized.
//!
//! Sequence counters and the replay window carry across rotations, so
//! nonces stay unique per key and the exactly-once guarantee holds for
//! frames of either generation.

use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::ROTATION_CONTRIB_SIZE;
use crate::crypto::{derive_rotated_keys, fill_random};
use crate::record::MessageType;

use super::{PendingRotation, RotationCache, Session, SessionEvent, SessionOutput, SessionPhase};

impl Session {
    /// Propose a rotation if this endpoint is the proposer; otherwise
    /// wait for the peer's proposal. Called when the rotation timer
    /// fires, and by operators forcing an early rotation.
    pub(crate) fn maybe_propose_rotation(&mut self) -> SessionOutput {
        match self.phase {
            SessionPhase::Established => {}
            // An outstanding proposal is retransmitted until acked.
            SessionPhase::Rotating if self.pending_rotation.is_some() => {}
            _ => return SessionOutput::default(),
        }
        if !self.is_rotation_proposer() {
            return SessionOutput::default();
        }
        self.propose_rotation()
    }

    /// Force a rotation proposal now (proposer side only; the
    /// non-proposing side returns an empty output and keeps waiting).
    pub fn rotate_now(&mut self) -> SessionOutput {
        self.next_rotation_at = Instant::now();
        self.maybe_propose_rotation()
    }

    fn propose_rotation(&mut self) -> SessionOutput {
        let contrib = match self.pending_rotation.as_ref() {
            // Retransmit the outstanding proposal with the same entropy;
            // the responder answers duplicates from its cache.
            Some(pending) => pending.contrib,
            None => {
                let mut contrib = [0u8; ROTATION_CONTRIB_SIZE];
                if fill_random(&mut contrib).is_err() {
                    return self.close_with(super::CloseCause::Fatal);
                }
                contrib
            }
        };

        match self.seal_outbound(MessageType::KeyRotationPropose, &contrib) {
            Ok(frame) => {
                self.phase = SessionPhase::Rotating;
                self.pending_rotation = Some(PendingRotation { contrib });
                debug!("proposed key rotation");
                SessionOutput::datagram(frame)
            }
            Err(_) => self.close_with(super::CloseCause::Fatal),
        }
    }

    /// Handle KEY_ROTATION_PROPOSE (responder side).
    pub(crate) fn handle_rotation_propose(&mut self, payload: &[u8]) -> SessionOutput {
        if self.phase != SessionPhase::Established {
            debug!(phase = self.phase.name(), "ignoring rotation propose");
            return SessionOutput::default();
        }
        let Ok(proposer_contrib) = <[u8; ROTATION_CONTRIB_SIZE]>::try_from(payload) else {
            debug!("dropping malformed rotation propose");
            return SessionOutput::default();
        };

        // A duplicate of the proposal we already answered: the ack was
        // lost, so re-send the identical frame instead of deriving a
        // second conflicting generation.
        if let Some(cache) = &self.rotation_cache {
            if cache.contrib == proposer_contrib {
                debug!("re-sending rotation ack for duplicate proposal");
                return SessionOutput::datagram(cache.ack_frame.clone());
            }
        }

        let mut own_contrib = [0u8; ROTATION_CONTRIB_SIZE];
        if fill_random(&mut own_contrib).is_err() {
            return self.close_with(super::CloseCause::Fatal);
        }

        let new_keys = match derive_rotated_keys(
            self.record.next_seed(),
            &proposer_contrib,
            &own_contrib,
            self.role,
        ) {
            Ok(keys) => keys,
            Err(_) => return self.close_with(super::CloseCause::Fatal),
        };

        // Acknowledge under the outgoing generation first, then install.
        let ack = match self.seal_outbound(MessageType::KeyRotationAck, &own_contrib) {
            Ok(frame) => frame,
            Err(_) => return self.close_with(super::CloseCause::Fatal),
        };
        self.record.install(new_keys);
        self.rotation_cache = Some(RotationCache {
            contrib: proposer_contrib,
            ack_frame: ack.clone(),
        });
        self.next_rotation_at = Instant::now() + self.rotation_interval;
        info!("session keys rotated");

        let mut output = SessionOutput::datagram(ack);
        output.events.push(SessionEvent::KeysRotated);
        output
    }

    /// Handle KEY_ROTATION_ACK (proposer side).
    pub(crate) fn handle_rotation_ack(&mut self, payload: &[u8]) -> SessionOutput {
        if self.phase != SessionPhase::Rotating {
            debug!(phase = self.phase.name(), "ignoring rotation ack");
            return SessionOutput::default();
        }
        let Some(pending) = self.pending_rotation.as_ref() else {
            return SessionOutput::default();
        };
        let Ok(responder_contrib) = <[u8; ROTATION_CONTRIB_SIZE]>::try_from(payload) else {
            debug!("dropping malformed rotation ack");
            return SessionOutput::default();
        };

        let new_keys = match derive_rotated_keys(
            self.record.next_seed(),
            &pending.contrib,
            &responder_contrib,
            self.role,
        ) {
            Ok(keys) => keys,
            Err(_) => return self.close_with(super::CloseCause::Fatal),
        };

        self.record.install(new_keys);
        self.pending_rotation = None;
        self.phase = SessionPhase::Established;
        self.next_rotation_at = Instant::now() + self.rotation_interval;
        info!("session keys rotated");
        SessionOutput::event(SessionEvent::KeysRotated)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{deliver, session_pair};
    use super::*;
    use crate::core::ProtocolConfig;

    /// The proposer and responder out of a fresh pair.
    fn ordered_pair(config: &ProtocolConfig) -> (Session, Session) {
        let (client, server) = session_pair(config);
        if client.is_rotation_proposer() {
            (client, server)
        } else {
            (server, client)
        }
    }

    fn complete_rotation(proposer: &mut Session, responder: &mut Session) {
        let propose = proposer.rotate_now();
        assert_eq!(proposer.phase(), SessionPhase::Rotating);

        let ack = deliver(responder, &propose);
        assert!(
            ack.events
                .iter()
                .any(|e| matches!(e, SessionEvent::KeysRotated))
        );

        let done = deliver(proposer, &ack);
        assert!(
            done.events
                .iter()
                .any(|e| matches!(e, SessionEvent::KeysRotated))
        );
        assert_eq!(proposer.phase(), SessionPhase::Established);
    }

    #[tokio::test]
    async fn test_rotation_completes_and_traffic_flows() {
        let config = ProtocolConfig::default();
        let (mut proposer, mut responder) = ordered_pair(&config);

        complete_rotation(&mut proposer, &mut responder);

        // Traffic flows under the new generation, both directions.
        let frame = proposer
            .send_application(MessageType::ChatRequest, b"ping2")
            .unwrap();
        assert_eq!(responder.handle_datagram(&frame).events.len(), 1);
        let frame = responder
            .send_application(MessageType::ChatResponse, b"pong2")
            .unwrap();
        assert_eq!(proposer.handle_datagram(&frame).events.len(), 1);
    }

    #[tokio::test]
    async fn test_only_lower_id_proposes() {
        let config = ProtocolConfig::default();
        let (mut proposer, mut responder) = ordered_pair(&config);

        assert!(proposer.is_rotation_proposer());
        assert!(!responder.is_rotation_proposer());
        assert!(responder.rotate_now().datagrams.is_empty());
        assert!(!proposer.rotate_now().datagrams.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_old_generation_frames_open_during_grace() {
        let config = ProtocolConfig::default();
        let (mut proposer, mut responder) = ordered_pair(&config);

        // Sealed under the old generation, delivered after rotation.
        let in_flight = proposer
            .send_application(MessageType::ChatRequest, b"late")
            .unwrap();

        complete_rotation(&mut proposer, &mut responder);

        let output = responder.handle_datagram(&in_flight);
        assert!(matches!(
            &output.events[..],
            [SessionEvent::Application { payload, .. }] if payload == b"late"
        ));
    }

    #[tokio::test]
    async fn test_lost_ack_recovered_by_duplicate_proposal() {
        let config = ProtocolConfig::default();
        let (mut proposer, mut responder) = ordered_pair(&config);

        let propose = proposer.rotate_now();
        // First ack is lost in the network.
        let lost_ack = deliver(&mut responder, &propose);
        assert_eq!(lost_ack.datagrams.len(), 1);

        // The proposer retransmits; the responder re-sends the identical
        // ack rather than deriving another generation.
        let retransmit = proposer.rotate_now();
        let resent_ack = deliver(&mut responder, &retransmit);
        assert_eq!(resent_ack.datagrams, lost_ack.datagrams);

        let done = deliver(&mut proposer, &resent_ack);
        assert!(
            done.events
                .iter()
                .any(|e| matches!(e, SessionEvent::KeysRotated))
        );

        // Both ends now agree on the new generation.
        let frame = proposer
            .send_application(MessageType::ChatRequest, b"ok")
            .unwrap();
        assert_eq!(responder.handle_datagram(&frame).events.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_rotations() {
        let config = ProtocolConfig::default();
        let (mut proposer, mut responder) = ordered_pair(&config);

        for round in 0..3 {
            complete_rotation(&mut proposer, &mut responder);
            let payload = format!("round {round}");
            let frame = proposer
                .send_application(MessageType::ChatRequest, payload.as_bytes())
                .unwrap();
            assert_eq!(responder.handle_datagram(&frame).events.len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_timer_fires_at_interval() {
        // Keepalive budgets wide enough that jumping the clock a full
        // rotation interval does not read as a dead peer.
        let config = ProtocolConfig {
            keepalive_interval: std::time::Duration::from_secs(3600),
            keepalive_timeout: std::time::Duration::from_secs(7200),
            ..Default::default()
        };
        let (mut proposer, mut responder) = ordered_pair(&config);

        // Nothing before the interval elapses.
        assert!(proposer.on_tick().datagrams.is_empty());

        tokio::time::advance(config.rotation_interval).await;
        let output = proposer.on_tick();
        // A keepalive ping may accompany the proposal; the proposal is
        // the rotation trigger we care about.
        assert_eq!(proposer.phase(), SessionPhase::Rotating);

        let ack = deliver(&mut responder, &output);
        let done = deliver(&mut proposer, &ack);
        assert!(
            done.events
                .iter()
                .any(|e| matches!(e, SessionEvent::KeysRotated))
        );
    }

    #[tokio::test]
    async fn test_malformed_proposal_ignored() {
        let config = ProtocolConfig::default();
        let (mut proposer, mut responder) = ordered_pair(&config);

        // Proposal with a short payload (sealed correctly, wrong size).
        let bogus = proposer
            .seal_outbound(MessageType::KeyRotationPropose, b"short")
            .unwrap();
        let output = responder.handle_datagram(&bogus);
        assert!(output.datagrams.is_empty());
        assert_eq!(responder.phase(), SessionPhase::Established);
    }
}
