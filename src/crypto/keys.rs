//! Session key material and the initial key schedule.
//!
//! Keys are derived with HKDF-SHA256 from the artifact's shared secret,
//! both endpoints' connection identifiers, and the handshake timestamp.
//! All key containers are zeroized on drop.

use zeroize::Zeroize;

use crate::core::{CONNECTION_ID_SIZE, CryptoError, HANDSHAKE_INFO, KEY_SIZE, SESSION_INFO};

use super::primitives::{hkdf_derive, random_u64};

/// Which end of the session this endpoint is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The punching side; reads the rendezvous artifact.
    Client,
    /// The answering side; writes the rendezvous artifact.
    Server,
}

impl Role {
    /// The opposite role.
    pub fn peer(self) -> Self {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// A 32-byte AEAD or MAC key, zeroized on drop.
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; KEY_SIZE],
}

impl SessionKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Overwrite the key material with zeros in place.
    pub fn zeroize(&mut self) {
        self.key.zeroize();
    }

    /// Whether the key material has been zeroized.
    pub fn is_zeroized(&self) -> bool {
        self.key.iter().all(|&b| b == 0)
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes never reach log output.
        f.write_str("SessionKey(..)")
    }
}

/// Random 64-bit per-endpoint connection identifier.
///
/// Exchanged during the handshake; mixed into the key schedule and used
/// as the tie-breaker for which side proposes key rotation (lower value
/// proposes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self(random_u64()?))
    }

    /// Create from a u64 value.
    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Create from wire bytes (big-endian).
    pub fn from_bytes(bytes: [u8; CONNECTION_ID_SIZE]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Wire representation (big-endian).
    pub fn to_bytes(self) -> [u8; CONNECTION_ID_SIZE] {
        self.0.to_be_bytes()
    }

    /// Numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A complete session key generation.
///
/// Per-direction AEAD keys, a shared MAC key for auxiliary tagging, and
/// the seed for the next rotation. Owned exclusively by the session; the
/// record layer borrows keys to seal and open but never mutates them.
#[derive(Debug)]
pub struct SessionKeys {
    /// AEAD key for frames this endpoint sends.
    pub tx: SessionKey,
    /// AEAD key for frames this endpoint receives.
    pub rx: SessionKey,
    /// Shared MAC key reserved for auxiliary tagging (compromise HMAC).
    pub mac: SessionKey,
    /// Seed for the next key rotation.
    pub next_seed: SessionKey,
}

impl SessionKeys {
    /// Overwrite every key in this generation with zeros.
    pub fn zeroize_all(&mut self) {
        self.tx.zeroize();
        self.rx.zeroize();
        self.mac.zeroize();
        self.next_seed.zeroize();
    }

    /// Whether every key in this generation is zeroized.
    pub fn is_zeroized(&self) -> bool {
        self.tx.is_zeroized()
            && self.rx.is_zeroized()
            && self.mac.is_zeroized()
            && self.next_seed.is_zeroized()
    }
}

/// Split 128 bytes of key schedule output into a [`SessionKeys`] for the
/// given role. Layout: client-to-server key, server-to-client key, MAC
/// key, next-rotation seed.
pub(crate) fn split_key_schedule(okm: &mut [u8; 4 * KEY_SIZE], role: Role) -> SessionKeys {
    let mut c2s = [0u8; KEY_SIZE];
    let mut s2c = [0u8; KEY_SIZE];
    let mut mac = [0u8; KEY_SIZE];
    let mut seed = [0u8; KEY_SIZE];
    c2s.copy_from_slice(&okm[..KEY_SIZE]);
    s2c.copy_from_slice(&okm[KEY_SIZE..2 * KEY_SIZE]);
    mac.copy_from_slice(&okm[2 * KEY_SIZE..3 * KEY_SIZE]);
    seed.copy_from_slice(&okm[3 * KEY_SIZE..]);
    okm.zeroize();

    let (tx, rx) = match role {
        Role::Client => (c2s, s2c),
        Role::Server => (s2c, c2s),
    };
    SessionKeys {
        tx: SessionKey::from_bytes(tx),
        rx: SessionKey::from_bytes(rx),
        mac: SessionKey::from_bytes(mac),
        next_seed: SessionKey::from_bytes(seed),
    }
}

/// Derive the initial session key generation.
///
/// `HKDF-SHA256(salt = "", ikm = shared_secret || client_id || server_id
/// || handshake_time, info = "ClawChat v2 Session")`, split per
/// direction. Both endpoints call this with identical inputs and agree
/// on the schedule.
pub fn derive_session_keys(
    shared_secret: &[u8; KEY_SIZE],
    client_id: ConnectionId,
    server_id: ConnectionId,
    handshake_time: u64,
    role: Role,
) -> Result<SessionKeys, CryptoError> {
    let mut ikm = [0u8; KEY_SIZE + 2 * CONNECTION_ID_SIZE + 8];
    ikm[..KEY_SIZE].copy_from_slice(shared_secret);
    ikm[KEY_SIZE..KEY_SIZE + 8].copy_from_slice(&client_id.to_bytes());
    ikm[KEY_SIZE + 8..KEY_SIZE + 16].copy_from_slice(&server_id.to_bytes());
    ikm[KEY_SIZE + 16..].copy_from_slice(&handshake_time.to_be_bytes());

    let mut okm = [0u8; 4 * KEY_SIZE];
    let result = hkdf_derive(&[], &ikm, SESSION_INFO, &mut okm);
    ikm.zeroize();
    result?;

    Ok(split_key_schedule(&mut okm, role))
}

/// Per-direction keys for sealing handshake frames.
///
/// Derived from the shared secret alone, before any identifiers have
/// been exchanged.
pub struct HandshakeKeys {
    /// Key for handshake frames this endpoint sends.
    pub tx: SessionKey,
    /// Key for handshake frames this endpoint receives.
    pub rx: SessionKey,
}

/// Derive the handshake frame keys for the given role.
///
/// `HKDF-SHA256(salt = "", ikm = shared_secret, info = "ClawChat v2
/// Handshake")` yields 64 bytes: the punch direction key then the ack
/// direction key.
pub fn derive_handshake_keys(
    shared_secret: &[u8; KEY_SIZE],
    role: Role,
) -> Result<HandshakeKeys, CryptoError> {
    let mut okm = [0u8; 2 * KEY_SIZE];
    hkdf_derive(&[], shared_secret, HANDSHAKE_INFO, &mut okm)?;

    let mut punch = [0u8; KEY_SIZE];
    let mut ack = [0u8; KEY_SIZE];
    punch.copy_from_slice(&okm[..KEY_SIZE]);
    ack.copy_from_slice(&okm[KEY_SIZE..]);
    okm.zeroize();

    let (tx, rx) = match role {
        Role::Client => (punch, ack),
        Role::Server => (ack, punch),
    };
    Ok(HandshakeKeys {
        tx: SessionKey::from_bytes(tx),
        rx: SessionKey::from_bytes(rx),
    })
}
