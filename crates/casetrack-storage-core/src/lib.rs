//! Core traits and types for the casetrack persistence engine.
//!
//! This crate defines the abstractions shared between the engine facade and
//! its backends:
//! - `DirectoryCapability` / `CapabilityProvider`: the revocable folder grant
//! - `HandleStore`: durable recall of the last granted folder
//! - `SnapshotSource`: the latest-document accessor collaborators supply
//! - the lifecycle reducer, status snapshot, and error taxonomy

mod capability;
mod document;
mod error;
mod handle;
mod lifecycle;
mod status;
mod watch;
mod write;

pub use capability::{CapabilityProvider, DirectoryCapability, PermissionState};
pub use document::{InMemoryDocument, SnapshotSource};
pub use error::{ErrorClass, StoreError};
pub use handle::{HandleStore, StoredHandleRecord};
pub use lifecycle::{reduce, LifecycleEvent, LifecycleState};
pub use status::{ErrorNotice, Severity, StatusSnapshot};
pub use watch::{DocumentMetadata, ExternalChangeEvent, ExternalChangeType};
pub use write::{WriteOptions, WriteReport, WriteTask};
