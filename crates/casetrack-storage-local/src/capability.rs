use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use casetrack_storage_core::{
    CapabilityProvider, DirectoryCapability, PermissionState, StoreError, StoredHandleRecord,
};
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, instrument, warn};

/// Name of the throwaway file used to probe writability.
const PROBE_FILE_NAME: &str = ".casetrack.probe";

/// Filesystem rendering of a directory capability.
///
/// Wraps a folder the user granted access to. The folder can disappear or
/// turn read-only at any time, which this capability reports as a lost
/// permission rather than a plain I/O failure.
#[derive(Debug, Clone)]
pub struct FsDirectoryCapability {
    root: PathBuf,
    display_name: String,
    granted_at: DateTime<Utc>,
}

impl FsDirectoryCapability {
    pub fn new(root: impl AsRef<Path>, granted_at: DateTime<Utc>) -> Self {
        let root = root.as_ref().to_path_buf();
        let display_name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| root.display().to_string());
        Self {
            root,
            display_name,
            granted_at,
        }
    }

    /// Resolve a plain file name inside the folder.
    ///
    /// Rejects names that would escape the granted folder.
    fn entry_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name == "."
            || name == ".."
        {
            return Err(StoreError::Io(format!("invalid file name: {name:?}")));
        }
        Ok(self.root.join(name))
    }

    /// Map an I/O failure on a file inside the folder.
    ///
    /// A vanished root directory and an OS permission error both mean the
    /// grant is gone; retrying cannot succeed without a fresh grant.
    fn map_write_err(&self, path: &Path, e: std::io::Error) -> StoreError {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                StoreError::PermissionLost(format!("{}: {}", path.display(), e))
            }
            std::io::ErrorKind::NotFound => StoreError::PermissionLost(format!(
                "folder {} no longer exists",
                self.root.display()
            )),
            _ => StoreError::Io(format!("{}: {}", path.display(), e)),
        }
    }
}

#[async_trait]
impl DirectoryCapability for FsDirectoryCapability {
    fn display_name(&self) -> String {
        self.display_name.clone()
    }

    fn to_record(&self) -> StoredHandleRecord {
        StoredHandleRecord {
            directory: self.root.clone(),
            display_name: self.display_name.clone(),
            granted_at: self.granted_at,
        }
    }

    #[instrument(skip(self), level = "debug", fields(dir = %self.root.display()))]
    async fn query_permission(&self) -> PermissionState {
        match fs::metadata(&self.root).await {
            Ok(meta) if !meta.is_dir() => PermissionState::Denied,
            Ok(meta) if meta.permissions().readonly() => PermissionState::Denied,
            Ok(_) => PermissionState::Granted,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PermissionState::Denied,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => PermissionState::Denied,
            Err(e) => {
                warn!("permission query on {} failed: {}", self.root.display(), e);
                PermissionState::Unknown
            }
        }
    }

    #[instrument(skip(self), level = "debug", fields(dir = %self.root.display()))]
    async fn request_permission(&self) -> PermissionState {
        // The metadata check answers cheaply when the folder is gone or
        // flagged read-only; only probe when it looks writable.
        match self.query_permission().await {
            PermissionState::Denied => return PermissionState::Denied,
            PermissionState::Unknown | PermissionState::Granted => {}
        }

        let probe = self.root.join(PROBE_FILE_NAME);
        match fs::write(&probe, b"").await {
            Ok(()) => {
                if let Err(e) = fs::remove_file(&probe).await {
                    debug!("probe cleanup failed: {}", e);
                }
                PermissionState::Granted
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => PermissionState::Denied,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PermissionState::Denied,
            Err(e) => {
                warn!("write probe in {} failed: {}", self.root.display(), e);
                PermissionState::Unknown
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.entry_path(name)?;
        match fs::read(&path).await {
            Ok(data) => {
                debug!("read {} ({} bytes)", name, data.len());
                Ok(Some(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Err(
                StoreError::PermissionLost(format!("{}: {}", path.display(), e)),
            ),
            Err(e) => Err(StoreError::Io(format!("{}: {}", path.display(), e))),
        }
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write_file(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.entry_path(name)?;

        // Write atomically via temp file so a failure leaves either the old
        // or the new content, never a torn document.
        let temp_path = self.root.join(format!("{name}.tmp"));
        fs::write(&temp_path, data)
            .await
            .map_err(|e| self.map_write_err(&temp_path, e))?;
        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| self.map_write_err(&path, e))?;

        debug!("wrote {} ({} bytes)", name, data.len());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove_file(&self, name: &str) -> Result<(), StoreError> {
        let path = self.entry_path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.map_write_err(&path, e)),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_files(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| self.map_write_err(&self.root, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Io(format!("failed to read dir entry: {}", e)))?
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            // Engine bookkeeping files and in-progress temp writes are not
            // part of the folder's visible contents.
            if name.starts_with('.') || name.ends_with(".tmp") {
                continue;
            }
            names.push(name);
        }

        names.sort();
        debug!("listed {} files in {}", names.len(), self.root.display());
        Ok(names)
    }
}

/// Provides filesystem capabilities for a folder chosen by the user.
///
/// The "user gesture" in this rendering is the caller handing the chosen
/// folder to the provider; `acquire` validates the choice without creating
/// anything.
#[derive(Debug, Clone)]
pub struct FsCapabilityProvider {
    root: PathBuf,
}

impl FsCapabilityProvider {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl CapabilityProvider for FsCapabilityProvider {
    #[instrument(skip(self), level = "debug", fields(dir = %self.root.display()))]
    async fn acquire(&self) -> Result<Arc<dyn DirectoryCapability>, StoreError> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => {
                Ok(Arc::new(FsDirectoryCapability::new(&self.root, Utc::now())))
            }
            Ok(_) => Err(StoreError::PermissionDenied(format!(
                "{} is not a folder",
                self.root.display()
            ))),
            Err(e) => Err(StoreError::PermissionDenied(format!(
                "{}: {}",
                self.root.display(),
                e
            ))),
        }
    }

    #[instrument(skip(self, record), level = "debug", fields(dir = %record.directory.display()))]
    async fn restore(
        &self,
        record: &StoredHandleRecord,
    ) -> Result<Arc<dyn DirectoryCapability>, StoreError> {
        match fs::metadata(&record.directory).await {
            Ok(meta) if meta.is_dir() => Ok(Arc::new(FsDirectoryCapability::new(
                &record.directory,
                record.granted_at,
            ))),
            Ok(_) => Err(StoreError::PermissionLost(format!(
                "{} is no longer a folder",
                record.directory.display()
            ))),
            Err(e) => Err(StoreError::PermissionLost(format!(
                "{}: {}",
                record.directory.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn capability(dir: &TempDir) -> FsDirectoryCapability {
        FsDirectoryCapability::new(dir.path(), Utc::now())
    }

    #[tokio::test]
    async fn query_grants_writable_folder() {
        let dir = TempDir::new().unwrap();
        assert_eq!(capability(&dir).query_permission().await, PermissionState::Granted);
    }

    #[tokio::test]
    async fn query_denies_missing_folder() {
        let dir = TempDir::new().unwrap();
        let cap = FsDirectoryCapability::new(dir.path().join("gone"), Utc::now());
        assert_eq!(cap.query_permission().await, PermissionState::Denied);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn query_denies_readonly_folder() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let mut perms = std::fs::metadata(dir.path()).unwrap().permissions();
        perms.set_mode(0o555);
        std::fs::set_permissions(dir.path(), perms).unwrap();

        let cap = capability(&dir);
        assert_eq!(cap.query_permission().await, PermissionState::Denied);
        // The request path must also refuse without probing.
        assert_eq!(cap.request_permission().await, PermissionState::Denied);

        let mut perms = std::fs::metadata(dir.path()).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(dir.path(), perms).unwrap();
    }

    #[tokio::test]
    async fn request_probes_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let cap = capability(&dir);
        assert_eq!(cap.request_permission().await, PermissionState::Granted);
        assert!(!dir.path().join(PROBE_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn verify_is_idempotent_until_revoked() {
        let dir = TempDir::new().unwrap();
        let cap = capability(&dir);
        assert_eq!(cap.query_permission().await, PermissionState::Granted);
        assert_eq!(cap.query_permission().await, PermissionState::Granted);

        // External revocation: the folder disappears.
        let path = dir.path().to_path_buf();
        drop(dir);
        let cap = FsDirectoryCapability::new(path, Utc::now());
        assert_eq!(cap.query_permission().await, PermissionState::Denied);
    }

    #[tokio::test]
    async fn read_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(capability(&dir).read_file("cases.json").await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let cap = capability(&dir);
        cap.write_file("cases.json", b"{\"cases\":[]}").await.unwrap();
        let bytes = cap.read_file("cases.json").await.unwrap().unwrap();
        assert_eq!(bytes, b"{\"cases\":[]}");
        // No temp file left behind.
        assert!(!dir.path().join("cases.json.tmp").exists());
    }

    #[tokio::test]
    async fn write_into_vanished_folder_is_permission_lost() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().to_path_buf();
        drop(dir);

        let cap = FsDirectoryCapability::new(path, Utc::now());
        let err = cap.write_file("cases.json", b"{}").await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionLost(_)));
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let cap = capability(&dir);
        assert!(cap.read_file("../escape").await.is_err());
        assert!(cap.write_file("a/b", b"x").await.is_err());
        assert!(cap.read_file("").await.is_err());
    }

    #[tokio::test]
    async fn list_skips_bookkeeping_files() {
        let dir = TempDir::new().unwrap();
        let cap = capability(&dir);
        cap.write_file("cases.json", b"{}").await.unwrap();
        std::fs::write(dir.path().join(".casetrack.lock"), b"").unwrap();
        std::fs::write(dir.path().join("cases.json.tmp"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"n").unwrap();

        assert_eq!(cap.list_files().await.unwrap(), vec!["cases.json", "notes.txt"]);
    }

    #[tokio::test]
    async fn remove_is_tolerant_of_absence() {
        let dir = TempDir::new().unwrap();
        let cap = capability(&dir);
        cap.remove_file("missing.json").await.unwrap();
    }

    #[tokio::test]
    async fn provider_acquire_validates_folder() {
        let dir = TempDir::new().unwrap();
        let provider = FsCapabilityProvider::new(dir.path());
        let cap = provider.acquire().await.unwrap();
        assert_eq!(cap.to_record().directory, dir.path());

        let missing = FsCapabilityProvider::new(dir.path().join("gone"));
        assert!(matches!(
            missing.acquire().await.unwrap_err(),
            StoreError::PermissionDenied(_)
        ));
    }

    #[tokio::test]
    async fn provider_restore_keeps_granted_at() {
        let dir = TempDir::new().unwrap();
        let provider = FsCapabilityProvider::new(dir.path());
        let record = provider.acquire().await.unwrap().to_record();

        let restored = provider.restore(&record).await.unwrap();
        assert_eq!(restored.to_record().granted_at, record.granted_at);

        let gone = StoredHandleRecord {
            directory: dir.path().join("gone"),
            display_name: "gone".into(),
            granted_at: record.granted_at,
        };
        assert!(matches!(
            provider.restore(&gone).await.unwrap_err(),
            StoreError::PermissionLost(_)
        ));
    }
}
