//! Key rotation derivation and old-generation retention.
//!
//! A rotation mixes both endpoints' fresh entropy contributions with the
//! previous generation's rotation seed. The old receive key stays
//! installed for the grace interval so in-flight frames still open; after
//! that it is zeroized.

use std::time::{Duration, Instant};

use zeroize::Zeroize;

use crate::core::{CryptoError, KEY_SIZE, ROTATION_CONTRIB_SIZE, ROTATION_INFO};

use super::keys::{Role, SessionKey, SessionKeys, split_key_schedule};
use super::primitives::hkdf_derive;

/// Derive the next session key generation.
///
/// `HKDF-SHA256(salt = next_seed, ikm = contrib_proposer ||
/// contrib_responder, info = "ClawChat v2 Rotation")`, split per
/// direction exactly like the initial schedule. The proposer is the
/// endpoint with the lower connection identifier; both sides order the
/// contributions the same way.
pub fn derive_rotated_keys(
    next_seed: &SessionKey,
    contrib_proposer: &[u8; ROTATION_CONTRIB_SIZE],
    contrib_responder: &[u8; ROTATION_CONTRIB_SIZE],
    role: Role,
) -> Result<SessionKeys, CryptoError> {
    let mut ikm = [0u8; 2 * ROTATION_CONTRIB_SIZE];
    ikm[..ROTATION_CONTRIB_SIZE].copy_from_slice(contrib_proposer);
    ikm[ROTATION_CONTRIB_SIZE..].copy_from_slice(contrib_responder);

    let mut okm = [0u8; 4 * KEY_SIZE];
    let result = hkdf_derive(next_seed.as_bytes(), &ikm, ROTATION_INFO, &mut okm);
    ikm.zeroize();
    result?;

    Ok(split_key_schedule(&mut okm, role))
}

/// Holds the previous generation's receive key through the grace window.
///
/// Only the receive side is retained: a sender switches to the new
/// generation the moment it is installed, while the receiver must keep
/// absorbing in-flight frames sealed under the old key.
pub struct OldKeyRetention {
    rx: Option<SessionKey>,
    retained_at: Option<Instant>,
    grace: Duration,
}

impl OldKeyRetention {
    /// Create a retention slot with the given grace window.
    pub fn new(grace: Duration) -> Self {
        Self {
            rx: None,
            retained_at: None,
            grace,
        }
    }

    /// Retain an outgoing generation's receive key, replacing (and
    /// thereby zeroizing) any previous retained key.
    pub fn retain(&mut self, rx: SessionKey) {
        self.rx = Some(rx);
        self.retained_at = Some(Instant::now());
    }

    /// The old receive key, if still within the grace window.
    pub fn old_rx(&self) -> Option<&SessionKey> {
        if self.within_grace() {
            self.rx.as_ref()
        } else {
            None
        }
    }

    /// Whether a retained key exists and the grace window is open.
    pub fn within_grace(&self) -> bool {
        self.retained_at.is_some_and(|t| t.elapsed() < self.grace)
    }

    /// Drop (and zeroize) the retained key.
    pub fn clear(&mut self) {
        self.rx = None;
        self.retained_at = None;
    }

    /// Drop the retained key if its grace window has expired.
    pub fn clear_if_expired(&mut self) {
        if self.retained_at.is_some_and(|t| t.elapsed() >= self.grace) {
            self.clear();
        }
    }
}
