//! The rendezvous artifact: the encrypted out-of-band bootstrap file.
//!
//! The server writes a small encrypted record to a fixed path; the
//! operator delivers it to the client out of band. It carries the server
//! endpoint and a single-use shared secret from which the handshake and
//! session keys are derived.

pub mod artifact;
pub mod envelope;
pub mod lifecycle;

pub use artifact::RendezvousArtifact;
pub use envelope::{decode, decode_at, encode};
pub use lifecycle::ArtifactStore;

use crate::core::ArtifactError;

/// Take `n` bytes from `data` at `cursor`, or fail as corrupt.
pub(crate) fn take<'a>(
    data: &'a [u8],
    cursor: &mut usize,
    n: usize,
) -> Result<&'a [u8], ArtifactError> {
    let start = *cursor;
    let end = start.checked_add(n).ok_or(ArtifactError::Corrupt)?;
    if end > data.len() {
        return Err(ArtifactError::Corrupt);
    }
    *cursor = end;
    Ok(&data[start..end])
}

/// Take a big-endian u64 from `data` at `cursor`.
pub(crate) fn take_u64(data: &[u8], cursor: &mut usize) -> Result<u64, ArtifactError> {
    let bytes = take(data, cursor, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(buf))
}
