//! The rendezvous artifact record and its canonical encoding.
//!
//! Canonical wire layout (network byte order, fixed field order):
//! ```text
//! +----------------+-------------------------+---------------+
//! | schema_version | server_addr             | shared_secret |
//! | 2 bytes (BE16) | 7 or 19 bytes (tagged)  | 32 bytes      |
//! +----------------+-------------------------+---------------+
//! | created_at     | expires_at | next_rotation | server_id  |
//! | 8 bytes (BE64) | 8 bytes    | 8 bytes       | 1+N bytes  |
//! +----------------+------------+---------------+------------+
//! ```
//! `server_id` is length-prefixed; length 0 means absent.

use std::net::SocketAddr;

use zeroize::Zeroize;

use crate::core::{
    ARTIFACT_SCHEMA_VERSION, ARTIFACT_VALIDITY, ArtifactError, SHARED_SECRET_SIZE,
    decode_socket_addr, encode_socket_addr,
};
use crate::crypto::fill_random;

use super::{take, take_u64};

/// The bootstrap record carried inside the encrypted envelope.
///
/// The shared secret is single-use: it never reappears in a subsequent
/// artifact, and the server destroys the file once a session starts.
pub struct RendezvousArtifact {
    /// Schema version (currently 2).
    pub schema_version: u16,
    /// Public endpoint the client should punch toward.
    pub server_addr: SocketAddr,
    /// Single-use 32-byte shared secret; zeroized on drop.
    shared_secret: [u8; SHARED_SECRET_SIZE],
    /// Creation time, seconds since the UNIX epoch.
    pub created_at: u64,
    /// Expiry time, seconds since the UNIX epoch.
    pub expires_at: u64,
    /// Hint for when the server will next replace the file.
    pub next_rotation: u64,
    /// Optional operator-assigned server identifier.
    pub server_id: Option<String>,
}

impl RendezvousArtifact {
    /// Create a fresh artifact with a random shared secret.
    ///
    /// `validity` is clamped by the protocol invariant
    /// (expiry - creation <= 11 minutes); a longer request is an error.
    pub fn generate(
        server_addr: SocketAddr,
        now: u64,
        validity_secs: u64,
        regen_secs: u64,
        server_id: Option<String>,
    ) -> Result<Self, ArtifactError> {
        if validity_secs > ARTIFACT_VALIDITY.as_secs() {
            return Err(ArtifactError::ValidityTooLong);
        }
        let mut shared_secret = [0u8; SHARED_SECRET_SIZE];
        fill_random(&mut shared_secret)?;
        Ok(Self {
            schema_version: ARTIFACT_SCHEMA_VERSION,
            server_addr,
            shared_secret,
            created_at: now,
            expires_at: now + validity_secs,
            next_rotation: now + regen_secs,
            server_id,
        })
    }

    /// Assemble an artifact from explicit fields (used by the codec and
    /// by tests that need a known secret).
    pub fn from_parts(
        server_addr: SocketAddr,
        shared_secret: [u8; SHARED_SECRET_SIZE],
        created_at: u64,
        expires_at: u64,
        next_rotation: u64,
        server_id: Option<String>,
    ) -> Self {
        Self {
            schema_version: ARTIFACT_SCHEMA_VERSION,
            server_addr,
            shared_secret,
            created_at,
            expires_at,
            next_rotation,
            server_id,
        }
    }

    /// The single-use shared secret.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn shared_secret(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.shared_secret
    }

    /// Whether the artifact has expired at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }

    /// Serialize to the canonical byte form.
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        out.extend_from_slice(&self.schema_version.to_be_bytes());
        encode_socket_addr(self.server_addr, &mut out);
        out.extend_from_slice(&self.shared_secret);
        out.extend_from_slice(&self.created_at.to_be_bytes());
        out.extend_from_slice(&self.expires_at.to_be_bytes());
        out.extend_from_slice(&self.next_rotation.to_be_bytes());
        match &self.server_id {
            Some(id) => {
                let bytes = id.as_bytes();
                out.push(bytes.len().min(u8::MAX as usize) as u8);
                out.extend_from_slice(&bytes[..bytes.len().min(u8::MAX as usize)]);
            }
            None => out.push(0),
        }
        out
    }

    /// Parse the canonical byte form, validating the schema version and
    /// the validity-window invariant.
    pub fn from_canonical_bytes(data: &[u8]) -> Result<Self, ArtifactError> {
        let mut cursor = 0usize;

        let version_bytes = take(data, &mut cursor, 2)?;
        let schema_version = u16::from_be_bytes([version_bytes[0], version_bytes[1]]);
        if schema_version != ARTIFACT_SCHEMA_VERSION {
            return Err(ArtifactError::UnsupportedVersion(schema_version));
        }

        let (server_addr, consumed) =
            decode_socket_addr(&data[cursor..]).ok_or(ArtifactError::Corrupt)?;
        cursor += consumed;

        let mut shared_secret = [0u8; SHARED_SECRET_SIZE];
        shared_secret.copy_from_slice(take(data, &mut cursor, SHARED_SECRET_SIZE)?);

        let created_at = take_u64(data, &mut cursor)?;
        let expires_at = take_u64(data, &mut cursor)?;
        let next_rotation = take_u64(data, &mut cursor)?;

        let id_len = take(data, &mut cursor, 1)?[0] as usize;
        let server_id = if id_len == 0 {
            None
        } else {
            let bytes = take(data, &mut cursor, id_len)?;
            Some(String::from_utf8(bytes.to_vec()).map_err(|_| ArtifactError::Corrupt)?)
        };

        if cursor != data.len() {
            return Err(ArtifactError::Corrupt);
        }
        if expires_at < created_at
            || expires_at - created_at > ARTIFACT_VALIDITY.as_secs()
        {
            return Err(ArtifactError::ValidityTooLong);
        }

        Ok(Self {
            schema_version,
            server_addr,
            shared_secret,
            created_at,
            expires_at,
            next_rotation,
            server_id,
        })
    }
}

impl Drop for RendezvousArtifact {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

impl PartialEq for RendezvousArtifact {
    fn eq(&self, other: &Self) -> bool {
        self.schema_version == other.schema_version
            && self.server_addr == other.server_addr
            && self.shared_secret == other.shared_secret
            && self.created_at == other.created_at
            && self.expires_at == other.expires_at
            && self.next_rotation == other.next_rotation
            && self.server_id == other.server_id
    }
}

impl Eq for RendezvousArtifact {}

impl std::fmt::Debug for RendezvousArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousArtifact")
            .field("schema_version", &self.schema_version)
            .field("server_addr", &self.server_addr)
            .field("shared_secret", &"..")
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("next_rotation", &self.next_rotation)
            .field("server_id", &self.server_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RendezvousArtifact {
        RendezvousArtifact::from_parts(
            "127.0.0.1:49300".parse().unwrap(),
            [0x22; SHARED_SECRET_SIZE],
            1_700_000_000,
            1_700_000_600,
            1_700_000_600,
            Some("claw-main".into()),
        )
    }

    #[test]
    fn test_canonical_roundtrip() {
        let artifact = sample();
        let bytes = artifact.to_canonical_bytes();
        let parsed = RendezvousArtifact::from_canonical_bytes(&bytes).unwrap();
        assert_eq!(parsed, artifact);
    }

    #[test]
    fn test_canonical_roundtrip_no_server_id() {
        let mut artifact = sample();
        artifact.server_id = None;
        let parsed =
            RendezvousArtifact::from_canonical_bytes(&artifact.to_canonical_bytes()).unwrap();
        assert_eq!(parsed.server_id, None);
    }

    #[test]
    fn test_canonical_roundtrip_v6() {
        let mut artifact = sample();
        artifact.server_addr = "[2001:db8::1]:49300".parse().unwrap();
        let parsed =
            RendezvousArtifact::from_canonical_bytes(&artifact.to_canonical_bytes()).unwrap();
        assert_eq!(parsed.server_addr, artifact.server_addr);
    }

    #[test]
    fn test_truncated_rejected() {
        let bytes = sample().to_canonical_bytes();
        for len in 0..bytes.len() {
            assert!(
                RendezvousArtifact::from_canonical_bytes(&bytes[..len]).is_err(),
                "truncation to {len} bytes was accepted"
            );
        }
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut bytes = sample().to_canonical_bytes();
        bytes.push(0x00);
        assert!(RendezvousArtifact::from_canonical_bytes(&bytes).is_err());
    }

    #[test]
    fn test_unsupported_schema_version() {
        let mut bytes = sample().to_canonical_bytes();
        bytes[1] = 0x07;
        assert!(matches!(
            RendezvousArtifact::from_canonical_bytes(&bytes),
            Err(ArtifactError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn test_validity_window_invariant() {
        let artifact = RendezvousArtifact::from_parts(
            "127.0.0.1:1".parse().unwrap(),
            [0u8; SHARED_SECRET_SIZE],
            1000,
            1000 + ARTIFACT_VALIDITY.as_secs() + 1,
            2000,
            None,
        );
        assert!(matches!(
            RendezvousArtifact::from_canonical_bytes(&artifact.to_canonical_bytes()),
            Err(ArtifactError::ValidityTooLong)
        ));
    }

    #[test]
    fn test_generate_secrets_are_single_use() {
        let addr = "127.0.0.1:1".parse().unwrap();
        let a = RendezvousArtifact::generate(addr, 1000, 660, 600, None).unwrap();
        let b = RendezvousArtifact::generate(addr, 1000, 660, 600, None).unwrap();
        assert_ne!(a.shared_secret(), b.shared_secret());
        assert_eq!(a.expires_at, 1660);
        assert_eq!(a.next_rotation, 1600);
    }

    #[test]
    fn test_generate_rejects_long_validity() {
        let addr = "127.0.0.1:1".parse().unwrap();
        assert!(RendezvousArtifact::generate(addr, 1000, 661, 600, None).is_err());
    }

    #[test]
    fn test_expiry() {
        let artifact = sample();
        assert!(!artifact.is_expired(1_700_000_600));
        assert!(artifact.is_expired(1_700_000_601));
    }
}
