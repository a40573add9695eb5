//! On-disk lifecycle of the rendezvous artifact.
//!
//! The artifact lives at a fixed path so a simple file-drop delivery
//! channel always targets the latest copy. Writes go through a temporary
//! file in the same directory followed by an atomic rename, preventing
//! torn reads. The file carries owner-only permissions.
//!
//! While the server session is IDLE the file is regenerated on a fixed
//! interval; regeneration halts once a session establishes; a compromise
//! deletes the file and immediately publishes a fresh one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;
use zeroize::Zeroize;

use crate::core::{ArtifactError, SHARED_SECRET_SIZE};

use super::artifact::RendezvousArtifact;
use super::envelope::{decode, encode, unix_now};

/// Reads and writes the artifact file for one endpoint.
pub struct ArtifactStore {
    path: PathBuf,
    bootstrap_secret: [u8; SHARED_SECRET_SIZE],
    validity_secs: u64,
    regen_secs: u64,
    server_id: Option<String>,
}

impl ArtifactStore {
    /// Create a store over the fixed artifact path.
    pub fn new(
        path: impl Into<PathBuf>,
        bootstrap_secret: [u8; SHARED_SECRET_SIZE],
        validity_secs: u64,
        regen_secs: u64,
        server_id: Option<String>,
    ) -> Self {
        Self {
            path: path.into(),
            bootstrap_secret,
            validity_secs,
            regen_secs,
            server_id,
        }
    }

    /// The fixed artifact path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generate a fresh artifact for `server_addr`, write it atomically,
    /// and return it (the server keeps the copy to answer the punch).
    pub fn publish(
        &self,
        server_addr: std::net::SocketAddr,
    ) -> Result<RendezvousArtifact, ArtifactError> {
        let artifact = RendezvousArtifact::generate(
            server_addr,
            unix_now(),
            self.validity_secs,
            self.regen_secs,
            self.server_id.clone(),
        )?;
        let blob = encode(&artifact, &self.bootstrap_secret)?;
        self.write_atomic(&blob)?;
        info!(path = %self.path.display(), expires_at = artifact.expires_at, "published rendezvous artifact");
        Ok(artifact)
    }

    /// Read and decode the artifact at the fixed path.
    pub fn load(&self) -> Result<RendezvousArtifact, ArtifactError> {
        let blob = fs::read(&self.path)?;
        decode(&blob, &self.bootstrap_secret)
    }

    /// Delete the artifact file. Missing files are not an error.
    pub fn destroy(&self) -> Result<(), ArtifactError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "destroyed rendezvous artifact");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Temporary-file + atomic-rename write with owner-only permissions.
    fn write_atomic(&self, blob: &[u8]) -> Result<(), ArtifactError> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                file.set_permissions(fs::Permissions::from_mode(0o600))?;
            }
            file.write_all(blob)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Drop for ArtifactStore {
    fn drop(&mut self) {
        self.bootstrap_secret.zeroize();
    }
}
