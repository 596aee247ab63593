use std::sync::Arc;

use casetrack_storage_core::DirectoryCapability;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

/// A timestamped copy of the document, taken before a destructive write.
///
/// Never deleted by the engine; retention is an application policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    /// File name of the copy inside the connected folder.
    pub file_name: String,
    pub created_at: DateTime<Utc>,
}

/// Writes a copy of the current on-disk document before any destructive
/// overwrite (import, migration, clear-all).
pub struct BackupManager {
    capability: Arc<dyn DirectoryCapability>,
}

impl BackupManager {
    pub fn new(capability: Arc<dyn DirectoryCapability>) -> Self {
        Self { capability }
    }

    /// Backup file name for a document, e.g.
    /// `cases.backup-20260805T101530123Z.json` for `cases.json`.
    pub fn backup_name(document_name: &str, at: DateTime<Utc>) -> String {
        let stamp = at.format("%Y%m%dT%H%M%S%3fZ");
        match document_name.rsplit_once('.') {
            Some((base, ext)) => format!("{base}.backup-{stamp}.{ext}"),
            None => format!("{document_name}.backup-{stamp}"),
        }
    }

    /// Copy the current on-disk document aside.
    ///
    /// Best-effort insurance, not a two-phase-commit guard: failures are
    /// logged and the caller proceeds with its write either way, because
    /// blocking the write on backup success would itself create
    /// unavailability. Returns `None` when there is nothing to back up or
    /// the copy failed.
    #[instrument(skip(self), level = "debug")]
    pub async fn create_backup(&self, document_name: &str) -> Option<BackupArtifact> {
        let current = match self.capability.read_file(document_name).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("no {} on disk, nothing to back up", document_name);
                return None;
            }
            Err(e) => {
                warn!("skipping backup of {}: {}", document_name, e);
                return None;
            }
        };

        let created_at = Utc::now();
        let file_name = Self::backup_name(document_name, created_at);
        match self.capability.write_file(&file_name, &current).await {
            Ok(()) => {
                debug!("backed up {} bytes to {}", current.len(), file_name);
                Some(BackupArtifact {
                    file_name,
                    created_at,
                })
            }
            Err(e) => {
                warn!("backup of {} failed: {}", document_name, e);
                None
            }
        }
    }
}
