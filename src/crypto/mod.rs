//! Cryptographic layer: primitive wrappers and the session key schedule.
//!
//! Everything here is a thin, typed wrapper over the RustCrypto crates.
//! Key containers zeroize on drop; raw key bytes never appear in log
//! output.

pub mod keys;
pub mod primitives;
pub mod rotation;

pub use keys::{
    ConnectionId, HandshakeKeys, Role, SessionKey, SessionKeys, derive_handshake_keys,
    derive_session_keys,
};
pub use primitives::{
    fill_random, hkdf_derive, hmac_sha256, hmac_verify, open, pbkdf2_derive, random_bytes,
    random_u64, seal,
};
pub use rotation::{OldKeyRetention, derive_rotated_keys};
