use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use casetrack_storage_core::StoreError;
use fs2::FileExt;
use tracing::debug;

/// Name of the lock file inside the connected folder.
pub const LOCK_FILE_NAME: &str = ".casetrack.lock";

/// OS-level exclusive lock on the connected folder.
///
/// Held for the lifetime of a connection so a second engine process cannot
/// also become the folder's writer. The lock is advisory between casetrack
/// processes; dropping the handle releases it, and a process crash releases
/// it automatically because the OS closes the descriptor.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock, failing fast when another process holds it.
    pub fn acquire(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                StoreError::Io(format!("failed to open lock file {}: {}", path.display(), e))
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("acquired instance lock {}", path.display());
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(StoreError::Locked(
                format!("{} is locked by another process", dir.display()),
            )),
            Err(e) => Err(StoreError::Io(format!(
                "failed to lock {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        debug!("released instance lock {}", self.path.display());
    }
}
