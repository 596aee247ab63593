use serde::{Deserialize, Serialize};

/// The engine's single authoritative connection/health state.
///
/// Exactly one value at a time; transitions are a total function of
/// (current state, event).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    RequestingPermission,
    Connecting,
    Ready,
    Recovering,
    Error,
    Disconnected,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Events folded into the lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    ConnectRequested,
    PermissionGranted,
    PermissionDenied { message: String },
    ConnectConfirmed,
    ConnectFailed { message: String },
    /// The capability was revoked while a write was in flight.
    WriteFailedPermission { message: String },
    /// A write exhausted its retry budget; the data stays in memory until a
    /// later manual save retries from scratch.
    WriteFailedTerminal { message: String },
    UserDisconnected,
}

impl LifecycleEvent {
    /// Error text accompanying the transition, if the event carries one.
    ///
    /// Errors reported by the executor or the permission coordinator travel
    /// with their event; they are never silently dropped.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::PermissionDenied { message }
            | Self::ConnectFailed { message }
            | Self::WriteFailedPermission { message }
            | Self::WriteFailedTerminal { message } => Some(message),
            _ => None,
        }
    }
}

/// Fold one event into the current state.
///
/// Total: every (state, event) pair returns a defined state. An event that
/// is not valid for the current state leaves it unchanged. Events can
/// legitimately race (a write failure can land just after the user already
/// disconnected), so a no-op is the correct answer, not a panic.
pub fn reduce(state: LifecycleState, event: &LifecycleEvent) -> LifecycleState {
    use self::LifecycleEvent as E;
    use self::LifecycleState as S;

    match (state, event) {
        (S::Idle | S::Error | S::Disconnected, E::ConnectRequested) => S::RequestingPermission,
        (S::RequestingPermission, E::PermissionGranted) => S::Connecting,
        (S::RequestingPermission | S::Connecting, E::PermissionDenied { .. }) => S::Error,
        (S::Connecting, E::ConnectConfirmed) => S::Ready,
        (S::RequestingPermission | S::Connecting, E::ConnectFailed { .. }) => S::Error,
        (S::Ready, E::WriteFailedPermission { .. }) => S::Recovering,
        // Exhausted retries leave the session connected; only the write is
        // abandoned.
        (S::Ready, E::WriteFailedTerminal { .. }) => S::Ready,
        (S::Recovering, E::PermissionGranted) => S::Ready,
        (_, E::UserDisconnected) => S::Disconnected,
        _ => state,
    }
}

#[cfg(test)]
mod tests {
    use super::{reduce, LifecycleEvent as E, LifecycleState as S};

    fn all_states() -> [S; 7] {
        [
            S::Idle,
            S::RequestingPermission,
            S::Connecting,
            S::Ready,
            S::Recovering,
            S::Error,
            S::Disconnected,
        ]
    }

    fn all_events() -> Vec<E> {
        vec![
            E::ConnectRequested,
            E::PermissionGranted,
            E::PermissionDenied { message: "m".into() },
            E::ConnectConfirmed,
            E::ConnectFailed { message: "m".into() },
            E::WriteFailedPermission { message: "m".into() },
            E::WriteFailedTerminal { message: "m".into() },
            E::UserDisconnected,
        ]
    }

    #[test]
    fn reducer_is_total() {
        for state in all_states() {
            for event in all_events() {
                // Must return a defined state for every pair; the value
                // itself is checked by the scenario tests below.
                let _ = reduce(state, &event);
            }
        }
    }

    #[test]
    fn happy_path_reaches_ready() {
        let mut state = S::Idle;
        state = reduce(state, &E::ConnectRequested);
        assert_eq!(state, S::RequestingPermission);
        state = reduce(state, &E::PermissionGranted);
        assert_eq!(state, S::Connecting);
        state = reduce(state, &E::ConnectConfirmed);
        assert_eq!(state, S::Ready);
    }

    #[test]
    fn denial_always_reaches_error_never_ready() {
        // From every state that can start a connect, a denied request ends
        // in Error.
        for start in [S::Idle, S::Error, S::Disconnected] {
            let mut state = reduce(start, &E::ConnectRequested);
            assert_eq!(state, S::RequestingPermission);
            state = reduce(state, &E::PermissionDenied { message: "refused".into() });
            assert_eq!(state, S::Error);
        }
    }

    #[test]
    fn permission_lost_mid_write_enters_recovering() {
        let state = reduce(S::Ready, &E::WriteFailedPermission { message: "revoked".into() });
        assert_eq!(state, S::Recovering);
        // Re-grant returns to ready.
        assert_eq!(reduce(state, &E::PermissionGranted), S::Ready);
        // Or the user gives up.
        assert_eq!(reduce(state, &E::UserDisconnected), S::Disconnected);
    }

    #[test]
    fn exhausted_retries_stay_ready() {
        let state = reduce(S::Ready, &E::WriteFailedTerminal { message: "disk full".into() });
        assert_eq!(state, S::Ready);
    }

    #[test]
    fn disconnect_wins_from_any_state() {
        for state in all_states() {
            assert_eq!(reduce(state, &E::UserDisconnected), S::Disconnected);
        }
    }

    #[test]
    fn racing_events_after_disconnect_are_no_ops() {
        // A write failure arriving just after the user disconnected must not
        // move the state.
        let state = S::Disconnected;
        assert_eq!(
            reduce(state, &E::WriteFailedPermission { message: "late".into() }),
            S::Disconnected
        );
        assert_eq!(
            reduce(state, &E::WriteFailedTerminal { message: "late".into() }),
            S::Disconnected
        );
        assert_eq!(reduce(state, &E::ConnectConfirmed), S::Disconnected);
        // Only a fresh connect leaves the terminal state.
        assert_eq!(reduce(state, &E::ConnectRequested), S::RequestingPermission);
    }

    #[test]
    fn invalid_events_leave_state_unchanged() {
        assert_eq!(reduce(S::Idle, &E::PermissionGranted), S::Idle);
        assert_eq!(reduce(S::Ready, &E::ConnectConfirmed), S::Ready);
        assert_eq!(
            reduce(S::Recovering, &E::WriteFailedPermission { message: "again".into() }),
            S::Recovering
        );
    }

    #[test]
    fn events_carry_their_error_message() {
        assert_eq!(
            E::PermissionDenied { message: "refused".into() }.error_message(),
            Some("refused")
        );
        assert_eq!(E::ConnectRequested.error_message(), None);
    }
}
