//! Process-level configuration.
//!
//! The recognized options, their defaults, and the loading of the
//! long-lived bootstrap secret from an environment variable or an
//! owner-readable file. Endpoint-specific knobs (bind address, backend
//! endpoint) live on the client and server config builders.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use super::constants::{
    ARTIFACT_REGEN_INTERVAL, ARTIFACT_VALIDITY, BACKEND_REPLY_TIMEOUT, GRACE_INTERVAL,
    HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT, ROTATION_INTERVAL,
    SHARED_SECRET_SIZE,
};
use super::error::ConfigError;

/// Process exit codes.
pub mod exit {
    /// Clean shutdown.
    pub const CLEAN: u8 = 0;
    /// Invalid or missing configuration.
    pub const BAD_CONFIG: u8 = 1;
    /// The public UDP socket could not be bound.
    pub const BIND_FAILURE: u8 = 2;
    /// Cryptographic initialization failed (RNG, key derivation).
    pub const CRYPTO_INIT_FAILURE: u8 = 3;
    /// The local backend was unreachable at server startup.
    pub const BACKEND_UNREACHABLE: u8 = 4;
}

/// Where the 32-byte bootstrap secret comes from.
#[derive(Debug, Clone)]
pub enum BootstrapSecretSource {
    /// A hex-encoded secret in an environment variable.
    Env(String),
    /// A file containing either 32 raw bytes or 64 hex characters.
    /// Must be readable only by the owning principal.
    File(PathBuf),
}

impl BootstrapSecretSource {
    /// Load and decode the secret.
    pub fn load(&self) -> Result<[u8; SHARED_SECRET_SIZE], ConfigError> {
        match self {
            Self::Env(var) => {
                let value = env::var(var).map_err(|_| {
                    ConfigError::SecretUnavailable(format!("environment variable {var} not set"))
                })?;
                decode_hex_secret(value.trim())
                    .ok_or_else(|| ConfigError::SecretUnavailable(format!("{var} is not a 64-character hex string")))
            }
            Self::File(path) => {
                let bytes = fs::read(path).map_err(|e| {
                    ConfigError::SecretUnavailable(format!("{}: {e}", path.display()))
                })?;
                if bytes.len() == SHARED_SECRET_SIZE {
                    let mut secret = [0u8; SHARED_SECRET_SIZE];
                    secret.copy_from_slice(&bytes);
                    return Ok(secret);
                }
                // Allow a hex-encoded file with trailing whitespace.
                let text = String::from_utf8_lossy(&bytes);
                decode_hex_secret(text.trim()).ok_or_else(|| {
                    ConfigError::SecretUnavailable(format!(
                        "{}: expected 32 raw bytes or 64 hex characters",
                        path.display()
                    ))
                })
            }
        }
    }
}

/// Decode a 64-character hex string into 32 bytes.
fn decode_hex_secret(s: &str) -> Option<[u8; SHARED_SECRET_SIZE]> {
    if s.len() != SHARED_SECRET_SIZE * 2 {
        return None;
    }
    let mut out = [0u8; SHARED_SECRET_SIZE];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}

/// Protocol timing knobs with the §-mandated defaults.
///
/// These are shared between client and server; endpoint-specific options
/// live on [`crate::client::ClientConfig`] and
/// [`crate::server::ServerConfig`].
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Key rotation interval (default 3600 s).
    pub rotation_interval: Duration,
    /// Grace window for old keys and old sockets (default 300 s).
    pub grace_interval: Duration,
    /// Artifact validity window (default 660 s).
    pub artifact_validity: Duration,
    /// Artifact regeneration interval while idle (default 600 s).
    pub artifact_regen: Duration,
    /// Total handshake budget (default 60 s).
    pub handshake_timeout: Duration,
    /// Keepalive ping interval (default 20 s).
    pub keepalive_interval: Duration,
    /// Keepalive failure budget (default 60 s).
    pub keepalive_timeout: Duration,
    /// Backend reply budget before BACKEND_UNAVAILABLE (default 60 s).
    pub backend_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            rotation_interval: ROTATION_INTERVAL,
            grace_interval: GRACE_INTERVAL,
            artifact_validity: ARTIFACT_VALIDITY,
            artifact_regen: ARTIFACT_REGEN_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            keepalive_timeout: KEEPALIVE_TIMEOUT,
            backend_timeout: BACKEND_REPLY_TIMEOUT,
        }
    }
}

impl ProtocolConfig {
    /// Validate cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.artifact_validity <= self.artifact_regen {
            return Err(ConfigError::InvalidValue {
                option: "artifact_validity_seconds",
                reason: "must exceed artifact_regen_seconds".into(),
            });
        }
        if self.artifact_validity > ARTIFACT_VALIDITY {
            return Err(ConfigError::InvalidValue {
                option: "artifact_validity_seconds",
                reason: format!("must not exceed {} seconds", ARTIFACT_VALIDITY.as_secs()),
            });
        }
        if self.keepalive_interval >= self.keepalive_timeout {
            return Err(ConfigError::InvalidValue {
                option: "keepalive_interval",
                reason: "must be shorter than the keepalive timeout".into(),
            });
        }
        Ok(())
    }
}
