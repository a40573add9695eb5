//! Core types shared by every layer: constants, configuration, errors,
//! and wire-level primitives that need no crypto or transport support.

pub mod config;
pub mod constants;
pub mod error;
pub mod wire;

pub use config::{BootstrapSecretSource, ProtocolConfig, exit};
pub use constants::*;
pub use error::{
    ArtifactError, ClawError, ConfigError, CryptoError, NatError, RecordDrop, RelayError,
    SessionError,
};
pub use wire::{CompromiseReason, ErrorCode, decode_socket_addr, encode_socket_addr};
