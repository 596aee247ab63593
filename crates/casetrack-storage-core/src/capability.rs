use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::handle::StoredHandleRecord;

/// Permission status of a directory capability.
///
/// Derived fresh from the capability on each lifecycle transition that needs
/// it; never assumed stale-safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    Unknown,
    Granted,
    Denied,
}

impl Default for PermissionState {
    fn default() -> Self {
        Self::Unknown
    }
}

/// An environment-granted, revocable reference to a folder.
///
/// Owned exclusively by the engine; domain collaborators never see it. The
/// host can revoke access at any time, so every file operation can fail with
/// a permission error even after a successful grant. At most one capability
/// is active per engine instance.
#[async_trait]
pub trait DirectoryCapability: Send + Sync + std::fmt::Debug {
    /// Human-readable name of the granted folder.
    fn display_name(&self) -> String;

    /// Record for persisting this capability across application restarts.
    fn to_record(&self) -> StoredHandleRecord;

    /// Non-intrusive permission check. Never prompts the user.
    ///
    /// A capability that is no longer resolvable reports `Denied`, exactly
    /// like an explicit refusal; both are unrecoverable without a fresh
    /// connect. Repeated calls on an unchanged capability return the same
    /// answer until an external revocation occurs.
    async fn query_permission(&self) -> PermissionState;

    /// Permission check that may probe the folder for writability.
    ///
    /// Only invoked in direct response to a user gesture, never on a
    /// background timer.
    async fn request_permission(&self) -> PermissionState;

    /// Read a file from the folder. Returns `None` when it does not exist.
    async fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a file atomically: after a failure the file holds either the
    /// old or the new content, never a partial write.
    async fn write_file(&self, name: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Remove a file. A missing file is not an error.
    async fn remove_file(&self, name: &str) -> Result<(), StoreError>;

    /// List file names in the folder.
    async fn list_files(&self) -> Result<Vec<String>, StoreError>;
}

/// Source of directory capabilities.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Acquire a fresh capability in response to a user gesture.
    async fn acquire(&self) -> Result<Arc<dyn DirectoryCapability>, StoreError>;

    /// Restore a capability from a stored record without prompting.
    ///
    /// Fails when the record no longer resolves to an accessible folder.
    async fn restore(
        &self,
        record: &StoredHandleRecord,
    ) -> Result<Arc<dyn DirectoryCapability>, StoreError>;
}
