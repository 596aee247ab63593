use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::PermissionState;
use crate::lifecycle::LifecycleState;

/// Severity of a subscriber-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Notification surfaced to subscribers when an operation fails terminally.
///
/// Carries enough context for the UI layer to distinguish "try again later"
/// from "you must re-grant access". The engine prescribes no copy or
/// modality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
    pub operation: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

/// Immutable point-in-time view of the engine.
///
/// Recomputed and replaced wholesale after every state-changing event, so a
/// subscriber can never observe a torn read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StatusSnapshot {
    /// Whether the autosave scheduler is running.
    pub is_running: bool,
    pub last_save_at: Option<DateTime<Utc>>,
    pub save_count: u64,
    /// 0 or 1: write tasks pending or in flight. Never more than one.
    pub pending_writes: u8,
    pub lifecycle: LifecycleState,
    pub permission: PermissionState,
    pub last_error: Option<ErrorNotice>,
}
