//! Cooperative termination shared by the resync worker threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Upper bound on how long a worker waits for work before re-checking its
/// termination flags.
pub const IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct SlaveControl {
    terminate: AtomicBool,
    only_if_idle: AtomicBool,
}

impl Default for SlaveControl {
    fn default() -> Self {
        Self {
            terminate: AtomicBool::new(false),
            only_if_idle: AtomicBool::new(true),
        }
    }
}

impl SlaveControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn self_terminate(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    /// With `false`, a terminating worker stops at the next loop boundary
    /// even when work is still queued.
    pub fn only_terminate_if_idle(&self, only_if_idle: bool) {
        self.only_if_idle.store(only_if_idle, Ordering::Release);
    }

    pub fn is_terminating(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Whether a terminating worker should drop work it has not finished.
    pub fn is_abandoning(&self) -> bool {
        self.is_terminating() && !self.only_if_idle.load(Ordering::Acquire)
    }

    pub fn should_exit(&self, idle: bool) -> bool {
        self.is_terminating() && (idle || !self.only_if_idle.load(Ordering::Acquire))
    }
}
