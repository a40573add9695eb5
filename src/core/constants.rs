//! Protocol constants for ClawChat v2.
//!
//! These values are fixed by the protocol and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// AES-256-GCM authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// AES-256-GCM nonce size.
pub const AEAD_NONCE_SIZE: usize = 12;

/// AEAD key size (AES-256).
pub const KEY_SIZE: usize = 32;

/// Shared secret carried in the rendezvous artifact.
pub const SHARED_SECRET_SIZE: usize = 32;

/// Per-endpoint connection identifier size (64-bit).
pub const CONNECTION_ID_SIZE: usize = 8;

/// Fresh entropy contribution carried in a rotation proposal or ack.
pub const ROTATION_CONTRIB_SIZE: usize = 32;

/// HMAC-SHA256 output size.
pub const HMAC_SIZE: usize = 32;

/// PBKDF2-HMAC-SHA256 iteration count for the artifact file key.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Protocol version carried in every record header.
pub const PROTOCOL_VERSION: u8 = 2;

// =============================================================================
// KEY DERIVATION LABELS
// =============================================================================

/// HKDF info label for handshake frame keys.
pub const HANDSHAKE_INFO: &[u8] = b"ClawChat v2 Handshake";

/// HKDF info label for the initial session key schedule.
pub const SESSION_INFO: &[u8] = b"ClawChat v2 Session";

/// HKDF info label for rotated session keys.
pub const ROTATION_INFO: &[u8] = b"ClawChat v2 Rotation";

// =============================================================================
// FRAME SIZES
// =============================================================================

/// Record header size (version + message_type + sequence).
pub const FRAME_HEADER_SIZE: usize = 1 + 1 + 8;

/// Minimum frame size (header + tag, no payload).
pub const MIN_FRAME_SIZE: usize = FRAME_HEADER_SIZE + AEAD_TAG_SIZE;

/// Maximum frame size: path MTU minus UDP/IP overhead.
pub const MAX_FRAME_SIZE: usize = 1472;

/// Maximum plaintext payload per frame. Larger application payloads must
/// be chunked by the application layer.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - MIN_FRAME_SIZE;

// =============================================================================
// ANTI-REPLAY
// =============================================================================

/// Replay window size in sequence numbers, per direction.
pub const REPLAY_WINDOW_SIZE: usize = 1024;

/// Consecutive AEAD failures after which the session closes.
pub const AUTH_FAIL_CLOSE_THRESHOLD: u32 = 32;

// =============================================================================
// TIMING - HANDSHAKE AND KEEPALIVE
// =============================================================================

/// Interval between HANDSHAKE_PUNCH transmissions.
pub const PUNCH_INTERVAL: Duration = Duration::from_millis(250);

/// Total handshake budget before HANDSHAKE_TIMEOUT surfaces.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Send KEEPALIVE_PING after this much idle time while established.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Close the session after this long without a KEEPALIVE_PONG.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// TIMING - ROTATION AND COMPROMISE
// =============================================================================

/// Key rotation fires this long after session creation (and periodically
/// thereafter).
pub const ROTATION_INTERVAL: Duration = Duration::from_secs(3600);

/// Old keys (and old sockets after a port rotation) stay valid this long.
pub const GRACE_INTERVAL: Duration = Duration::from_secs(300);

/// The server may rebind its public UDP port at this interval.
pub const PORT_ROTATION_INTERVAL: Duration = Duration::from_secs(3600);

/// Wait this long for COMPROMISED_ACK before closing unilaterally.
pub const COMPROMISE_ACK_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// TIMING - RENDEZVOUS ARTIFACT
// =============================================================================

/// Artifact validity window (expiry - creation), 11 minutes.
pub const ARTIFACT_VALIDITY: Duration = Duration::from_secs(660);

/// Regenerate the artifact at this interval while idle, 10 minutes.
pub const ARTIFACT_REGEN_INTERVAL: Duration = Duration::from_secs(600);

// =============================================================================
// RELAY
// =============================================================================

/// Default local backend endpoint port.
pub const DEFAULT_BACKEND_PORT: u16 = 55556;

/// Give up waiting for a backend reply after this long and surface
/// BACKEND_UNAVAILABLE to the peer.
pub const BACKEND_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// RENDEZVOUS FILE ENVELOPE
// =============================================================================

/// On-disk envelope version.
pub const ENVELOPE_VERSION: u16 = 2;

/// Envelope algorithm identifier.
pub const ALGORITHM_ID: &str = "AES-256-GCM+PBKDF2-SHA256";

/// Artifact schema version (inner, pre-encryption record).
pub const ARTIFACT_SCHEMA_VERSION: u16 = 2;

/// PBKDF2 salt size in the envelope.
pub const ENVELOPE_SALT_SIZE: usize = 32;

/// Default artifact file name.
pub const DEFAULT_ARTIFACT_NAME: &str = "clawchat-current.rdv";
