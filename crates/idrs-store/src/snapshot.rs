use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use idrs_core::{Resource, ResourceId};

use crate::cipher::Cipher;
use crate::envelope::Envelope;

const SNAPSHOT_EXT: &str = "json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistOutcome {
    Written,
    /// Another writer holds the resource's lock; the next flush retries.
    Skipped,
}

#[derive(Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    cipher: Option<Arc<dyn Cipher>>,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("dir", &self.dir)
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

impl SnapshotStore {
    pub fn new(dir: PathBuf, cipher: Option<Arc<dyn Cipher>>) -> Self {
        Self { dir, cipher }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// `<dir>/<resource_id>.json`
    pub fn path_for(&self, id: &ResourceId) -> PathBuf {
        self.dir.join(format!("{}.{SNAPSHOT_EXT}", id.as_str()))
    }

    /// Write one snapshot atomically.
    ///
    /// Skips without blocking when a concurrent persist of the same id holds
    /// the lock.
    pub fn persist(&self, resource: &Resource) -> Result<PersistOutcome> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create data directory: {}", self.dir.display()))?;

        let Some(_lock) = idrs_lock::try_acquire(&self.dir, resource.id.as_str())? else {
            debug!(resource_id = %resource.id, "persist lock held, skipping");
            return Ok(PersistOutcome::Skipped);
        };

        let plaintext =
            serde_json::to_vec_pretty(resource).context("failed to serialize resource")?;
        let bytes = match &self.cipher {
            Some(cipher) => {
                let envelope = Envelope::seal(cipher.as_ref(), &plaintext)
                    .with_context(|| format!("failed to encrypt resource {}", resource.id))?;
                serde_json::to_vec_pretty(&envelope).context("failed to serialize envelope")?
            }
            None => plaintext,
        };

        let path = self.path_for(&resource.id);
        let tmp_path = self.dir.join(format!("{}.{SNAPSHOT_EXT}.tmp", resource.id.as_str()));
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| format!("failed to open temp snapshot: {}", tmp_path.display()))?;
            set_file_mode_600(&tmp_path)?;
            file.write_all(&bytes)
                .with_context(|| format!("failed to write temp snapshot: {}", tmp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to sync temp snapshot: {}", tmp_path.display()))?;
        }
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to atomically replace snapshot {}", path.display()))?;

        debug!(resource_id = %resource.id, path = %path.display(), "persisted resource");
        Ok(PersistOutcome::Written)
    }

    /// Read one snapshot.
    ///
    /// A missing file is `Ok(None)`. Unreadable content is logged and also
    /// yields `Ok(None)`; only I/O errors on an existing file are returned.
    pub fn load(&self, id: &ResourceId) -> Result<Option<Resource>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes =
            fs::read(&path).with_context(|| format!("failed to read snapshot {}", path.display()))?;
        Ok(self.decode(&bytes, &path))
    }

    /// Every readable snapshot in the data directory.
    pub fn load_all(&self) -> Result<Vec<Resource>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut resources = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list data directory {}", self.dir.display()))?;
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(error) => {
                    warn!(dir = %self.dir.display(), %error, "skipping unreadable directory entry");
                    continue;
                }
            };
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(&ResourceId::from(stem)) {
                Ok(Some(resource)) => resources.push(resource),
                Ok(None) => {}
                Err(error) => {
                    warn!(path = %path.display(), error = %format!("{error:#}"), "skipping snapshot");
                }
            }
        }
        resources.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(resources)
    }

    fn decode(&self, bytes: &[u8], path: &Path) -> Option<Resource> {
        if let Ok(envelope) = serde_json::from_slice::<Envelope>(bytes) {
            match &self.cipher {
                Some(cipher) => match envelope.open(cipher.as_ref()) {
                    Ok(plain) => match serde_json::from_slice::<Resource>(&plain) {
                        Ok(resource) => return Some(resource),
                        Err(error) => {
                            warn!(path = %path.display(), %error, "decrypted snapshot is not a resource");
                        }
                    },
                    Err(error) => {
                        warn!(path = %path.display(), error = %format!("{error:#}"), "cannot decrypt snapshot");
                    }
                },
                None => {
                    warn!(path = %path.display(), "encrypted snapshot but encryption is disabled");
                }
            }
        }

        // Best effort: the stored bytes may be plaintext.
        match serde_json::from_slice::<Resource>(bytes) {
            Ok(resource) => Some(resource),
            Err(error) => {
                warn!(path = %path.display(), %error, "ignoring corrupt snapshot");
                None
            }
        }
    }
}

#[cfg(unix)]
fn set_file_mode_600(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_file_mode_600(_path: &Path) -> Result<()> {
    Ok(())
}
