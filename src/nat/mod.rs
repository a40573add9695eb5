//! NAT rendezvous engine: public-endpoint discovery and hole punching.
//!
//! Given a decoded rendezvous artifact, the engine binds an ephemeral
//! UDP socket, optionally probes operator-supplied reflectors for the
//! socket's public mapping, then runs the simultaneous-send punch until
//! the server's authenticated acknowledgment arrives.

pub mod punch;
pub mod stun;

pub use punch::{RendezvousConfig, RendezvousOutcome, rendezvous};
pub use stun::query_mapped_address;
