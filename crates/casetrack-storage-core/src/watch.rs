use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Types of external changes that can be detected on the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalChangeType {
    Modified,
    Deleted,
    Created,
}

/// Metadata about the on-disk document for comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// File size in bytes.
    pub size_bytes: u64,
    /// Last modification time (Unix timestamp).
    pub modified_at: i64,
    /// SHA-256 content hash, when the file could be read.
    pub content_hash: Option<Vec<u8>>,
}

/// A change made to a watched file by something other than the engine's own
/// write path, e.g. another application or a manual edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalChangeEvent {
    /// File name within the connected folder.
    pub file_name: String,
    pub change_type: ExternalChangeType,
    /// Previous metadata, if known.
    pub old_metadata: Option<DocumentMetadata>,
    /// Metadata observed after the change.
    pub new_metadata: Option<DocumentMetadata>,
    pub detected_at: DateTime<Utc>,
}
