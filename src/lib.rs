//! # ClawChat Protocol
//!
//! ClawChat is a peer-to-peer messaging and remote-administration protocol
//! built on NAT-traversing encrypted UDP. One client talks to one server;
//! the server relays decrypted application traffic to a co-located backend
//! over a loopback datagram socket. The crate provides:
//!
//! - **Rendezvous**: an out-of-band encrypted bootstrap artifact carrying
//!   the server endpoint and a single-use shared secret
//! - **Security**: AES-256-GCM record layer with anti-replay, periodic key
//!   rotation, and a fail-secure compromise protocol
//! - **Traversal**: simultaneous-send UDP hole punching with an optional
//!   STUN-style public-endpoint probe
//! - **Relay**: opaque forwarding of application frames (chat, file ops,
//!   scheduled tasks) between the session and a local backend
//!
//! ## Feature Flags
//!
//! - `transport` (default): UDP sockets and the NAT rendezvous engine
//! - `crypto` (default): AEAD primitives, key schedule, record layer
//! - `rendezvous` (default): artifact codec and on-disk lifecycle
//! - `session` (default): handshake, rotation, compromise, keepalive
//! - `relay` (default): server-side backend gateway
//! - `client` / `server` (default): high-level endpoint APIs
//!
//! ## Modules
//!
//! - [`core`]: constants, configuration, and error types (always included)
//! - [`crypto`]: cryptographic primitives and the session key schedule
//! - [`record`]: wire framing, AEAD seal/open, replay protection
//! - [`rendezvous`]: the encrypted bootstrap artifact
//! - [`transport`]: async UDP socket wrapper
//! - [`nat`]: hole punching and public-endpoint discovery
//! - [`session`]: the session state machine
//! - [`relay`]: the backend gateway
//! - [`client`] / [`server`]: endpoint APIs

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Crypto layer (feature-gated)
#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod crypto;

// Record layer (feature-gated)
#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod record;

// Rendezvous artifact (feature-gated)
#[cfg(feature = "rendezvous")]
#[cfg_attr(docsrs, doc(cfg(feature = "rendezvous")))]
pub mod rendezvous;

// Transport layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// NAT rendezvous engine (feature-gated)
#[cfg(all(feature = "session", feature = "rendezvous"))]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod nat;

// Session state machine (feature-gated)
#[cfg(feature = "session")]
#[cfg_attr(docsrs, doc(cfg(feature = "session")))]
pub mod session;

// Relay gateway (feature-gated)
#[cfg(feature = "relay")]
#[cfg_attr(docsrs, doc(cfg(feature = "relay")))]
pub mod relay;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    #[cfg(feature = "crypto")]
    pub use crate::crypto::{ConnectionId, SessionKey, SessionKeys};

    #[cfg(feature = "crypto")]
    pub use crate::record::{FrameHeader, MessageType, RecordLayer};

    #[cfg(feature = "rendezvous")]
    pub use crate::rendezvous::{ArtifactStore, RendezvousArtifact};

    #[cfg(feature = "transport")]
    pub use crate::transport::{ClawSocket, ClawSocketBuilder};

    #[cfg(feature = "session")]
    pub use crate::session::{Session, SessionEvent, SessionPhase};

    #[cfg(feature = "client")]
    pub use crate::client::{ClawClient, ClientConfig};

    #[cfg(feature = "server")]
    pub use crate::server::{ClawServer, ServerConfig};
}

// Re-export commonly used items at crate root
pub use self::core::{ClawError, CompromiseReason};

#[cfg(feature = "crypto")]
pub use record::{MessageType, RecordLayer};

#[cfg(feature = "rendezvous")]
pub use rendezvous::RendezvousArtifact;

#[cfg(feature = "session")]
pub use session::{Session, SessionEvent, SessionPhase};
