//! Bounded queue of subtree paths feeding the gather slaves.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};

const PUSH_RECHECK: Duration = Duration::from_millis(100);

pub struct GatherWorkQueue {
    tx: Sender<PathBuf>,
    rx: Receiver<PathBuf>,
    capacity: usize,
}

impl GatherWorkQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks while the queue is full. Returns `false` without queueing when
    /// `abort` is raised during the wait.
    pub fn push(&self, path: PathBuf, abort: &AtomicBool) -> bool {
        let mut pending = path;
        loop {
            if abort.load(Ordering::Relaxed) {
                return false;
            }
            match self.tx.send_timeout(pending, PUSH_RECHECK) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(path)) => pending = path,
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    pub fn pop(&self, timeout: Duration) -> Option<PathBuf> {
        match self.rx.recv_timeout(timeout) {
            Ok(path) => Some(path),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}
