use std::path::{Path, PathBuf};

use async_trait::async_trait;
use casetrack_storage_core::{HandleStore, StoreError, StoredHandleRecord};
use tokio::fs;
use tracing::{debug, instrument, warn};

const RECORD_FILE_NAME: &str = "handle.json";

/// File-backed handle store.
///
/// Persists the single stored-handle record as JSON in its own directory,
/// outside any connected folder, so a corrupted document never takes down
/// handle recall. Missing, unreadable, or unparseable state reads as "no
/// handle", which callers treat as normal.
#[derive(Debug, Clone)]
pub struct FileHandleStore {
    dir: PathBuf,
}

impl FileHandleStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Store under the platform-local data directory.
    pub fn at_default_location() -> Self {
        let dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("casetrack");
        Self::new(dir)
    }

    fn record_path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE_NAME)
    }
}

#[async_trait]
impl HandleStore for FileHandleStore {
    #[instrument(skip(self, record), level = "debug", fields(dir = %record.directory.display()))]
    async fn save(&self, record: &StoredHandleRecord) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            StoreError::HandleStore(format!("failed to create {}: {}", self.dir.display(), e))
        })?;

        let json = serde_json::to_string_pretty(record)
            .map_err(|e| StoreError::HandleStore(format!("failed to serialize record: {}", e)))?;

        let path = self.record_path();
        let temp_path = self.dir.join(format!("{RECORD_FILE_NAME}.tmp"));
        fs::write(&temp_path, &json).await.map_err(|e| {
            StoreError::HandleStore(format!("failed to write {}: {}", temp_path.display(), e))
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            StoreError::HandleStore(format!("failed to rename to {}: {}", path.display(), e))
        })?;

        debug!("saved handle record for {}", record.display_name);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn load(&self) -> Option<StoredHandleRecord> {
        let path = self.record_path();
        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("handle store unavailable at {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_str(&json) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("discarding unparseable handle record {}: {}", path.display(), e);
                None
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn clear(&self) -> Result<(), StoreError> {
        let path = self.record_path();
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("cleared handle record");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::HandleStore(format!(
                "failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }
}
