use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Persisted memory of the last granted folder.
///
/// Single slot: saving overwrites any prior record. Lives outside the main
/// document so a corrupted document never takes down handle recall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHandleRecord {
    /// Reference to the granted folder.
    pub directory: PathBuf,
    /// Human-readable folder name.
    pub display_name: String,
    /// When the user granted access.
    pub granted_at: DateTime<Utc>,
}

/// Durable store for the last granted folder record.
///
/// Backed by a persistent local key-value store, not the connected folder.
#[async_trait]
pub trait HandleStore: Send + Sync {
    /// Overwrite any previously stored record.
    async fn save(&self, record: &StoredHandleRecord) -> Result<(), StoreError>;

    /// Load the stored record.
    ///
    /// Returns `None` when nothing has ever been saved or the underlying
    /// store is unavailable. "No handle" is a normal, expected state, not an
    /// error.
    async fn load(&self) -> Option<StoredHandleRecord>;

    /// Delete the stored record. Absence is not an error.
    async fn clear(&self) -> Result<(), StoreError>;
}
