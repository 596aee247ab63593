use thiserror::Error;

/// Errors that can occur in the persistence engine.
///
/// Every public facade method returns these as values; nothing in the engine
/// throws across the facade boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("no folder connected")]
    NotConnected,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("permission lost: {0}")]
    PermissionLost(String),

    #[error("document corrupt: {0}")]
    Corrupt(String),

    #[error("handle store error: {0}")]
    HandleStore(String),

    #[error("backup error: {0}")]
    Backup(String),

    #[error("watch error: {0}")]
    Watch(String),

    #[error("folder already in use: {0}")]
    Locked(String),

    #[error("{operation} failed after retries: {message}")]
    RetriesExhausted { operation: String, message: String },
}

/// Retry classification of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with bounded backoff.
    Transient,
    /// Requires a fresh user grant; retrying cannot succeed.
    Permission,
    /// Neither retryable nor permission-related.
    Fatal,
}

impl StoreError {
    /// Classify this error for the retry policy.
    ///
    /// Unclassifiable host errors arrive here as `Io` and default to
    /// transient with a bounded retry budget, rather than declaring the
    /// session unrecoverable.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::PermissionDenied(_) | Self::PermissionLost(_) => ErrorClass::Permission,
            Self::NotConnected
            | Self::Serialization(_)
            | Self::Corrupt(_)
            | Self::Locked(_)
            | Self::RetriesExhausted { .. } => ErrorClass::Fatal,
            Self::Io(_) | Self::HandleStore(_) | Self::Backup(_) | Self::Watch(_) => {
                ErrorClass::Transient
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_errors_are_not_retried() {
        assert_eq!(
            StoreError::PermissionLost("revoked".into()).class(),
            ErrorClass::Permission
        );
        assert_eq!(
            StoreError::PermissionDenied("refused".into()).class(),
            ErrorClass::Permission
        );
    }

    #[test]
    fn io_errors_default_to_transient() {
        assert_eq!(StoreError::Io("disk busy".into()).class(), ErrorClass::Transient);
    }

    #[test]
    fn exhausted_retries_are_terminal() {
        let err = StoreError::RetriesExhausted {
            operation: "autosave".into(),
            message: "disk full".into(),
        };
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert_eq!(err.to_string(), "autosave failed after retries: disk full");
    }
}
