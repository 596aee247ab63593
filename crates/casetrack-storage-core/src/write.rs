use chrono::{DateTime, Utc};

/// Options accompanying an explicit document write.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// A full-document replace (import/migration/clear), as opposed to an
    /// incremental autosave. Triggers a backup of the current on-disk
    /// document before the write.
    pub destructive: bool,
}

/// One unit of work for the write executor.
///
/// Created when a debounce window elapses, the periodic fallback fires, or a
/// caller requests an explicit write; consumed and discarded by the
/// executor. At most one task is in flight at a time.
#[derive(Debug, Clone)]
pub struct WriteTask {
    /// Snapshot of the serialized document taken when the task was created.
    pub payload: Vec<u8>,
    pub destructive: bool,
    /// Physical attempts performed so far.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl WriteTask {
    pub fn new(payload: Vec<u8>, destructive: bool) -> Self {
        Self {
            payload,
            destructive,
            attempt: 0,
            created_at: Utc::now(),
            last_error: None,
        }
    }
}

/// Result of a write that reached disk.
#[derive(Debug, Clone)]
pub struct WriteReport {
    /// SHA-256 hash of the bytes that reached disk.
    pub content_hash: Vec<u8>,
    pub completed_at: DateTime<Utc>,
    /// Physical attempts the write took (1 = first try succeeded).
    pub attempts: u32,
}
