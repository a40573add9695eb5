//! Relay gateway: forwards decrypted application frames to the local
//! backend socket and re-injects backend replies into the session.

pub mod gateway;

pub use gateway::{RelayConfig, RelayGateway};
