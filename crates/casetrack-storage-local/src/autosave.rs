use std::time::{Duration, Instant};

/// Tuning for the autosave scheduler.
#[derive(Debug, Clone, Copy)]
pub struct AutosaveConfig {
    /// Quiet period after the last change before a write fires. Restarted
    /// on every change.
    pub debounce: Duration,
    /// Upper bound between the first unflushed change and its write. A
    /// pathological stream of changes that keeps restarting the debounce
    /// window still persists within this interval.
    pub fallback_interval: Duration,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(5),
            fallback_interval: Duration::from_secs(60),
        }
    }
}

/// Deadline/dirty bookkeeping for autosave.
///
/// Pure state machine: the engine's driver task owns the actual timers and
/// feeds in `Instant`s, which keeps every scheduling decision testable
/// without sleeping. At most one write is in flight; a change recorded
/// while one is in flight marks the state dirty again so a follow-up write
/// picks up the newer snapshot once the current attempt completes.
#[derive(Debug)]
pub struct AutosavePlan {
    config: AutosaveConfig,
    dirty: bool,
    dirty_since: Option<Instant>,
    last_change_at: Option<Instant>,
    in_flight: bool,
}

impl AutosavePlan {
    pub fn new(config: AutosaveConfig) -> Self {
        Self {
            config,
            dirty: false,
            dirty_since: None,
            last_change_at: None,
            in_flight: false,
        }
    }

    /// Record an in-memory mutation.
    pub fn record_change(&mut self, now: Instant) {
        if !self.dirty {
            self.dirty = true;
            self.dirty_since = Some(now);
        }
        self.last_change_at = Some(now);
    }

    /// A write is starting; its snapshot captures all recorded changes.
    pub fn start_in_flight(&mut self) {
        self.in_flight = true;
        self.dirty = false;
        self.dirty_since = None;
        self.last_change_at = None;
    }

    /// The in-flight write finished, successfully or not.
    ///
    /// A failed task is abandoned, not rescheduled: its payload survives in
    /// memory and a later change or manual save starts over. Changes that
    /// arrived during the flight already re-marked the state dirty.
    pub fn complete(&mut self) {
        self.in_flight = false;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Whether a write task is pending or in flight (0 or 1, never more).
    pub fn has_pending(&self) -> bool {
        self.dirty || self.in_flight
    }

    /// When the next write should fire, if any.
    pub fn deadline(&self) -> Option<Instant> {
        if !self.dirty || self.in_flight {
            return None;
        }
        let last_change = self.last_change_at?;
        let dirty_since = self.dirty_since.unwrap_or(last_change);
        let debounce_deadline = last_change + self.config.debounce;
        let fallback_deadline = dirty_since + self.config.fallback_interval;
        Some(debounce_deadline.min(fallback_deadline))
    }
}
