//! Local filesystem persistence engine for the casetrack application.
//!
//! Turns a user-granted folder into a durable, crash-tolerant document store
//! with autosave:
//! - `StorageEngine`: the facade domain collaborators talk to
//! - `FsDirectoryCapability` / `FsCapabilityProvider`: the revocable folder
//!   grant, rendered over the local filesystem
//! - `FileHandleStore`: remembers the last granted folder across restarts
//! - `WriteExecutor`: serialize, write, verify, with bounded retry
//! - `AutosavePlan`: debounce plus periodic-fallback scheduling
//! - `BackupManager`: timestamped copies before destructive overwrites
//! - `DocumentWatcher`: external change detection

mod autosave;
mod backup;
mod capability;
mod config;
mod engine;
mod executor;
mod handle_store;
mod instance_lock;
mod permission;
mod watcher;

pub use autosave::{AutosaveConfig, AutosavePlan};
pub use backup::{BackupArtifact, BackupManager};
pub use capability::{FsCapabilityProvider, FsDirectoryCapability};
pub use config::{Cli, Command, EngineConfig};
pub use engine::StorageEngine;
pub use executor::{RetryPolicy, WriteExecutor};
pub use handle_store::FileHandleStore;
pub use instance_lock::{InstanceLock, LOCK_FILE_NAME};
pub use permission::PermissionCoordinator;
pub use watcher::DocumentWatcher;
