use std::sync::Mutex;

/// Accessor for the latest in-memory document snapshot.
///
/// The autosave scheduler always pulls through this accessor at fire time
/// rather than caching a value, so a write persists the freshest state even
/// when several mutations land inside one debounce window.
pub trait SnapshotSource: Send + Sync {
    /// Serialized bytes of the current document.
    fn latest_snapshot(&self) -> Vec<u8>;
}

/// Minimal `SnapshotSource` backed by a mutex-guarded byte buffer.
///
/// Used by the inspector binary and by tests; a real application exposes its
/// own domain state instead.
#[derive(Debug, Default)]
pub struct InMemoryDocument {
    bytes: Mutex<Vec<u8>>,
}

impl InMemoryDocument {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    /// Replace the whole document.
    pub fn replace(&self, bytes: Vec<u8>) {
        *self.bytes.lock().unwrap() = bytes;
    }
}

impl SnapshotSource for InMemoryDocument {
    fn latest_snapshot(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_snapshot_reflects_replacement() {
        let doc = InMemoryDocument::new(b"v1".to_vec());
        assert_eq!(doc.latest_snapshot(), b"v1");
        doc.replace(b"v2".to_vec());
        assert_eq!(doc.latest_snapshot(), b"v2");
    }
}
