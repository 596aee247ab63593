use std::sync::Arc;

use casetrack_storage_core::{DirectoryCapability, PermissionState};
use tracing::{debug, instrument};

/// Verifies and (re-)requests read/write capability on the held folder.
///
/// `verify` never prompts; `request` may probe the folder and is only called
/// in direct response to a user gesture, never from a background timer.
/// A capability that is no longer resolvable classifies as denied, the same
/// as an explicit refusal: both need a fresh connect to recover.
pub struct PermissionCoordinator {
    capability: Arc<dyn DirectoryCapability>,
}

impl PermissionCoordinator {
    pub fn new(capability: Arc<dyn DirectoryCapability>) -> Self {
        Self { capability }
    }

    /// Non-intrusive permission check. Idempotent until an external
    /// revocation occurs.
    #[instrument(skip(self), level = "debug")]
    pub async fn verify(&self) -> PermissionState {
        let state = self.capability.query_permission().await;
        debug!(?state, "verified {}", self.capability.display_name());
        state
    }

    /// Permission check that may probe the folder.
    #[instrument(skip(self), level = "debug")]
    pub async fn request(&self) -> PermissionState {
        let state = self.capability.request_permission().await;
        debug!(?state, "requested access to {}", self.capability.display_name());
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::FsDirectoryCapability;
    use chrono::Utc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn verify_and_request_agree_on_writable_folder() {
        let dir = TempDir::new().unwrap();
        let cap = Arc::new(FsDirectoryCapability::new(dir.path(), Utc::now()));
        let coordinator = PermissionCoordinator::new(cap);

        assert_eq!(coordinator.verify().await, PermissionState::Granted);
        assert_eq!(coordinator.request().await, PermissionState::Granted);
    }

    #[tokio::test]
    async fn unresolvable_capability_classifies_as_denied() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone");
        let cap = Arc::new(FsDirectoryCapability::new(path, Utc::now()));
        let coordinator = PermissionCoordinator::new(cap);

        assert_eq!(coordinator.verify().await, PermissionState::Denied);
        assert_eq!(coordinator.request().await, PermissionState::Denied);
    }
}
