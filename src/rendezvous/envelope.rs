//! The encrypted on-disk envelope around a rendezvous artifact.
//!
//! Envelope layout (network byte order):
//! ```text
//! +------------------+----------------+----------------+---------+
//! | envelope_version | algorithm_id   | kdf_iterations | salt    |
//! | 2 bytes (BE16)   | 1+25 bytes     | 4 bytes (BE32) | 32 bytes|
//! +------------------+----------------+----------------+---------+
//! | nonce            | ciphertext || auth_tag                    |
//! | 12 bytes         | remainder (tag = last 16 bytes)           |
//! +------------------+-------------------------------------------+
//! ```
//! The file key is PBKDF2-HMAC-SHA256(bootstrap_secret, salt, 100000);
//! the canonical artifact bytes are sealed with AES-256-GCM and empty
//! associated data.

use std::time::{SystemTime, UNIX_EPOCH};

use zeroize::Zeroize;

use crate::core::{
    AEAD_NONCE_SIZE, AEAD_TAG_SIZE, ALGORITHM_ID, ArtifactError, ENVELOPE_SALT_SIZE,
    ENVELOPE_VERSION, PBKDF2_ITERATIONS, SHARED_SECRET_SIZE,
};
use crate::crypto::{fill_random, open, pbkdf2_derive, seal};

use super::artifact::RendezvousArtifact;
use super::take;

/// Seconds since the UNIX epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Encrypt an artifact into its on-disk envelope.
pub fn encode(
    artifact: &RendezvousArtifact,
    bootstrap_secret: &[u8; SHARED_SECRET_SIZE],
) -> Result<Vec<u8>, ArtifactError> {
    let mut salt = [0u8; ENVELOPE_SALT_SIZE];
    fill_random(&mut salt)?;
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    fill_random(&mut nonce)?;

    let mut file_key = pbkdf2_derive(bootstrap_secret, &salt);
    let mut plaintext = artifact.to_canonical_bytes();
    let sealed = seal(&file_key, &nonce, &[], &plaintext);
    file_key.zeroize();
    plaintext.zeroize();
    let sealed = sealed?;

    let algo = ALGORITHM_ID.as_bytes();
    let mut out = Vec::with_capacity(2 + 1 + algo.len() + 4 + salt.len() + nonce.len() + sealed.len());
    out.extend_from_slice(&ENVELOPE_VERSION.to_be_bytes());
    out.push(algo.len() as u8);
    out.extend_from_slice(algo);
    out.extend_from_slice(&PBKDF2_ITERATIONS.to_be_bytes());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt and validate an envelope, checking expiry against the system
/// clock.
pub fn decode(
    blob: &[u8],
    bootstrap_secret: &[u8; SHARED_SECRET_SIZE],
) -> Result<RendezvousArtifact, ArtifactError> {
    decode_at(blob, bootstrap_secret, unix_now())
}

/// Decrypt and validate an envelope against an explicit clock.
///
/// An expired artifact returns [`ArtifactError::Expired`] without
/// exposing its shared secret; the decrypted bytes are zeroized before
/// the error is returned.
pub fn decode_at(
    blob: &[u8],
    bootstrap_secret: &[u8; SHARED_SECRET_SIZE],
    now: u64,
) -> Result<RendezvousArtifact, ArtifactError> {
    let mut cursor = 0usize;

    let version_bytes = take(blob, &mut cursor, 2)?;
    let version = u16::from_be_bytes([version_bytes[0], version_bytes[1]]);
    if version != ENVELOPE_VERSION {
        return Err(ArtifactError::UnsupportedVersion(version));
    }

    let algo_len = take(blob, &mut cursor, 1)?[0] as usize;
    let algo = take(blob, &mut cursor, algo_len)?;
    if algo != ALGORITHM_ID.as_bytes() {
        return Err(ArtifactError::Corrupt);
    }

    let iter_bytes = take(blob, &mut cursor, 4)?;
    let iterations =
        u32::from_be_bytes([iter_bytes[0], iter_bytes[1], iter_bytes[2], iter_bytes[3]]);
    if iterations != PBKDF2_ITERATIONS {
        return Err(ArtifactError::Corrupt);
    }

    let mut salt = [0u8; ENVELOPE_SALT_SIZE];
    salt.copy_from_slice(take(blob, &mut cursor, ENVELOPE_SALT_SIZE)?);
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce.copy_from_slice(take(blob, &mut cursor, AEAD_NONCE_SIZE)?);

    let ciphertext = &blob[cursor..];
    if ciphertext.len() < AEAD_TAG_SIZE {
        return Err(ArtifactError::Corrupt);
    }

    let mut file_key = pbkdf2_derive(bootstrap_secret, &salt);
    let opened = open(&file_key, &nonce, &[], ciphertext);
    file_key.zeroize();
    let mut plaintext = opened.map_err(|_| ArtifactError::WrongKey)?;

    let artifact = RendezvousArtifact::from_canonical_bytes(&plaintext);
    plaintext.zeroize();
    let artifact = artifact?;

    if artifact.is_expired(now) {
        // Dropping the artifact zeroizes its secret.
        return Err(ArtifactError::Expired);
    }
    Ok(artifact)
}
