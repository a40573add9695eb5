//! Error types for the ClawChat protocol.
//!
//! Per-frame failures (bad AEAD tag, replay, malformed header) are modeled
//! as [`RecordDrop`] values that the session loop counts and discards; they
//! never propagate. Session-level failures surface synchronously to the
//! caller that owns the session.

use thiserror::Error;

/// Errors in the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD authentication failure. Fatal for the frame, never retried.
    #[error("AEAD authentication failed")]
    AeadFailure,

    /// AEAD encryption failed (payload too large for the cipher).
    #[error("AEAD encryption failed")]
    SealFailure,

    /// Key derivation produced the wrong amount of output.
    #[error("key derivation failed")]
    KeyDerivation,

    /// Transmit sequence counter exhausted - session must terminate.
    #[error("sequence counter exhausted")]
    CounterExhausted,

    /// Auxiliary MAC did not verify.
    #[error("MAC verification failed")]
    MacMismatch,

    /// The system CSPRNG could not produce output. Fatal for the process.
    #[error("insufficient entropy from system RNG")]
    EntropyExhausted,
}

/// Reasons the record layer silently drops a received frame.
///
/// These are values, not propagating errors: the receive path counts the
/// drop for operational visibility and moves on. No reply frame is sent.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RecordDrop {
    /// Frame shorter than header + tag.
    #[error("frame too short")]
    TooShort,

    /// Frame longer than the path MTU allows.
    #[error("frame exceeds maximum size")]
    Oversized,

    /// Header version does not match the protocol version.
    #[error("version mismatch: 0x{0:02x}")]
    VersionMismatch(u8),

    /// Unknown message type opcode.
    #[error("unknown message type: 0x{0:02x}")]
    UnknownType(u8),

    /// AEAD open failed under every installed key generation.
    #[error("authentication failed")]
    AuthFailed,

    /// Sequence outside the replay window or already accepted.
    #[error("replay rejected")]
    Replayed,
}

/// Errors decoding or validating a rendezvous artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The blob is truncated or structurally invalid.
    #[error("artifact corrupt")]
    Corrupt,

    /// The envelope decrypts only under a different bootstrap secret.
    #[error("artifact sealed under a different bootstrap secret")]
    WrongKey,

    /// The artifact's expiry time has passed.
    #[error("artifact expired")]
    Expired,

    /// Envelope or schema version is not supported.
    #[error("unsupported artifact version: {0}")]
    UnsupportedVersion(u16),

    /// The artifact's validity window exceeds the protocol maximum.
    #[error("artifact validity window too long")]
    ValidityTooLong,

    /// Cryptographic failure while generating or sealing an artifact.
    #[error("artifact crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    /// Filesystem error reading or writing the artifact.
    #[error("artifact i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors in the session state machine.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No HANDSHAKE_ACK arrived within the handshake budget.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// No KEEPALIVE_PONG arrived within the keepalive budget.
    #[error("keepalive timed out")]
    KeepaliveTimeout,

    /// Operation requires an established session.
    #[error("session is not established (phase: {0})")]
    NotEstablished(&'static str),

    /// The session has transitioned to CLOSED.
    #[error("session closed")]
    Closed,

    /// Payload exceeds the per-frame maximum; chunk it at the application
    /// layer.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Unrecoverable state inconsistency, socket death, or key
    /// desynchronization. Forces CLOSED with key zeroization.
    #[error("session fatal: {0}")]
    Fatal(String),

    /// Crypto failure escalated to session level.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// I/O error on the session socket.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the NAT rendezvous engine.
#[derive(Debug, Error)]
pub enum NatError {
    /// Two reflectors returned differing public ports for the same local
    /// socket. Advisory: the punch is still attempted.
    #[error("likely symmetric NAT: reflectors disagree on mapped port")]
    SymmetricNat,

    /// The peer never answered any HANDSHAKE_PUNCH.
    #[error("no response from peer")]
    NoResponse,

    /// The local UDP socket could not be bound.
    #[error("local bind failed: {0}")]
    LocalBindFail(std::io::Error),
}

/// Errors in the relay gateway.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The local backend is unreachable or did not reply in time.
    /// Surfaced to the peer as an ERROR frame; the session stays open.
    #[error("backend unavailable")]
    BackendUnavailable,

    /// I/O error on the backend socket.
    #[error("backend i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A recognized option has an invalid value.
    #[error("invalid value for {option}: {reason}")]
    InvalidValue {
        /// The offending option name.
        option: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The bootstrap secret could not be loaded.
    #[error("bootstrap secret unavailable: {0}")]
    SecretUnavailable(String),
}

/// Top-level ClawChat errors.
#[derive(Debug, Error)]
pub enum ClawError {
    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Artifact error.
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Session error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// NAT traversal error.
    #[error("nat error: {0}")]
    Nat(#[from] NatError),

    /// Relay error.
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
