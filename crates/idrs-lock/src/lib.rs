//! Per-resource persistence locks using `flock(2)` directly.
//!
//! The guard owns the open `File` carrying the advisory lock; `Drop` calls
//! `flock(fd, LOCK_UN)`. Locks are taken with `LOCK_NB`: a held lock is
//! reported as `None` so the caller can skip instead of blocking.
//!
//! `flock` locks belong to the open file description, so two attempts from
//! the same process contend just like attempts from different processes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Written into the lock file while held.
#[derive(Debug, Serialize, Deserialize)]
struct LockDiagnostic {
    pid: u32,
    resource_id: String,
    acquired_at: DateTime<Utc>,
}

pub struct PersistLock {
    file: File,
    lock_path: PathBuf,
}

impl std::fmt::Debug for PersistLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistLock")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

impl Drop for PersistLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        // SAFETY: `fd` is a valid file descriptor owned by `self.file`.
        // Closing the fd right after would release the lock anyway.
        unsafe {
            libc::flock(fd, libc::LOCK_UN);
        }
    }
}

impl PersistLock {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

/// Lock file path for a resource: `{root}/locks/{resource_id}.lock`.
pub fn lock_path_for(root: &Path, resource_id: &str) -> PathBuf {
    root.join("locks").join(format!("{resource_id}.lock"))
}

/// Try to take the exclusive persist lock for `resource_id`.
///
/// Returns `Ok(None)` when another holder has it. I/O failures (cannot create
/// the locks directory, cannot open the file) are errors.
pub fn try_acquire(root: &Path, resource_id: &str) -> Result<Option<PersistLock>> {
    let lock_path = lock_path_for(root, resource_id);
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create locks directory: {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;

    let fd = file.as_raw_fd();
    // SAFETY: `fd` comes from the `File` opened above and stays valid for
    // the duration of the call.
    let ret = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Ok(None);
        }
        return Err(err).with_context(|| format!("flock failed: {}", lock_path.display()));
    }

    let mut lock = PersistLock { file, lock_path };
    let diagnostic = LockDiagnostic {
        pid: std::process::id(),
        resource_id: resource_id.to_string(),
        acquired_at: Utc::now(),
    };
    let json = serde_json::to_string(&diagnostic).context("Failed to serialize lock diagnostic")?;
    lock.file
        .set_len(0)
        .context("Failed to truncate lock file")?;
    lock.file
        .write_all(json.as_bytes())
        .context("Failed to write lock diagnostic")?;
    lock.file.flush().context("Failed to flush lock file")?;

    Ok(Some(lock))
}
