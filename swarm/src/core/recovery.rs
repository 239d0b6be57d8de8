//! Recovery actions attached to failure classifications.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Rate-limit backoff window.
pub const RATE_LIMIT_BACKOFF_MIN: Duration = Duration::from_secs(5 * 60);
pub const RATE_LIMIT_BACKOFF_MAX: Duration = Duration::from_secs(10 * 60);
/// Pause after a generic network/API error.
pub const NETWORK_PAUSE: Duration = Duration::from_secs(60);

/// What the mission loop does after recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum RecoveryAction {
    /// Grow the per-session timeout (capped) and continue.
    ExtendTimeout,
    /// Sleep a random duration in `[min_secs, max_secs]`, then continue.
    Backoff { min_secs: u64, max_secs: u64 },
    /// Sleep a fixed duration, then continue.
    Pause { secs: u64 },
    /// Continue immediately.
    Continue,
}

impl RecoveryAction {
    pub fn rate_limit_backoff() -> Self {
        RecoveryAction::Backoff {
            min_secs: RATE_LIMIT_BACKOFF_MIN.as_secs(),
            max_secs: RATE_LIMIT_BACKOFF_MAX.as_secs(),
        }
    }

    pub fn network_pause() -> Self {
        RecoveryAction::Pause {
            secs: NETWORK_PAUSE.as_secs(),
        }
    }

    /// Concrete pause for this action, drawing jitter from `rng`.
    pub fn pause_duration<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Duration> {
        match *self {
            RecoveryAction::Backoff { min_secs, max_secs } => {
                let secs = if max_secs > min_secs {
                    rng.gen_range(min_secs..=max_secs)
                } else {
                    min_secs
                };
                Some(Duration::from_secs(secs))
            }
            RecoveryAction::Pause { secs } => Some(Duration::from_secs(secs)),
            RecoveryAction::ExtendTimeout | RecoveryAction::Continue => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RecoveryAction::ExtendTimeout => "extend_timeout",
            RecoveryAction::Backoff { .. } => "backoff",
            RecoveryAction::Pause { .. } => "pause",
            RecoveryAction::Continue => "continue",
        }
    }
}

/// Per-slot session timeout that grows on timeouts, up to a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutBudget {
    current: Duration,
    increment: Duration,
    cap: Duration,
}

impl TimeoutBudget {
    pub fn new(base: Duration, increment: Duration, cap: Duration) -> Self {
        Self {
            current: base,
            increment,
            cap: cap.max(base),
        }
    }

    /// Resume from a persisted timeout, clamped into `[base, cap]`.
    pub fn resumed(self, persisted: Option<Duration>) -> Self {
        match persisted {
            Some(value) => Self {
                current: value.clamp(self.current, self.cap),
                ..self
            },
            None => self,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Grow by one increment, saturating at the cap. Returns the new value.
    pub fn extend(&mut self) -> Duration {
        self.current = (self.current + self.increment).min(self.cap);
        self.current
    }
}
