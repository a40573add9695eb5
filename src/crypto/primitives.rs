//! AES-256-GCM, HKDF-SHA256, PBKDF2-HMAC-SHA256, HMAC-SHA256, CSPRNG.
//!
//! All operations are constant-time with respect to secrets on both the
//! success and failure paths (the underlying RustCrypto implementations
//! guarantee this). An AEAD authentication failure is a fatal signal for
//! the frame and is never retried; RNG failure is fatal for the process.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::core::{AEAD_NONCE_SIZE, AEAD_TAG_SIZE, CryptoError, KEY_SIZE, PBKDF2_ITERATIONS};

type HmacSha256 = Hmac<Sha256>;

/// Encrypt and authenticate `plaintext` under `key`.
///
/// Returns `ciphertext || tag` (16-byte GCM tag appended).
pub fn seal(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; AEAD_NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::SealFailure)
}

/// Verify and decrypt `ciphertext || tag` under `key`.
///
/// Returns `AeadFailure` if the tag does not verify; no plaintext is
/// released on failure.
pub fn open(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; AEAD_NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < AEAD_TAG_SIZE {
        return Err(CryptoError::AeadFailure);
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AeadFailure)
}

/// HKDF-SHA256 extract-and-expand into `out`.
pub fn hkdf_derive(
    salt: &[u8],
    ikm: &[u8],
    info: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, out).map_err(|_| CryptoError::KeyDerivation)
}

/// PBKDF2-HMAC-SHA256 with the protocol iteration count.
pub fn pbkdf2_derive(password: &[u8], salt: &[u8]) -> [u8; KEY_SIZE] {
    let mut out = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password, salt, PBKDF2_ITERATIONS, &mut out);
    out
}

/// HMAC-SHA256 over `data`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time HMAC-SHA256 verification.
pub fn hmac_verify(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

/// Fill `out` with cryptographically random bytes.
///
/// RNG failure is unrecoverable; it surfaces as `EntropyExhausted` and the
/// process must terminate.
pub fn fill_random(out: &mut [u8]) -> Result<(), CryptoError> {
    OsRng
        .try_fill_bytes(out)
        .map_err(|_| CryptoError::EntropyExhausted)
}

/// Return `n` cryptographically random bytes.
pub fn random_bytes(n: usize) -> Result<Vec<u8>, CryptoError> {
    let mut out = vec![0u8; n];
    fill_random(&mut out)?;
    Ok(out)
}

/// Return a cryptographically random u64.
pub fn random_u64() -> Result<u64, CryptoError> {
    let mut bytes = [0u8; 8];
    fill_random(&mut bytes)?;
    Ok(u64::from_be_bytes(bytes))
}
