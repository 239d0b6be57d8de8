//! Cooperative cancellation shared by the mission loop and its subprocess.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Granularity at which blocking waits re-check for cancellation.
pub const POLL_SLICE: Duration = Duration::from_millis(200);

/// Cloneable interrupt flag. Once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Suspension point abstraction so cooldowns and backoffs are testable.
pub trait Sleeper {
    /// Sleep for `duration` unless cancelled first. Returns `false` if cancelled.
    fn pause(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

/// Real sleeper that wakes every [`POLL_SLICE`] to observe cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn pause(&self, duration: Duration, cancel: &CancelToken) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return true;
            };
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(POLL_SLICE));
        }
    }
}
