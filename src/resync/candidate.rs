//! Resync candidates and the store that hands them from gather to apply.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex};

use crate::core::TargetId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    File,
    Dir,
}

impl CandidateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateKind::File => "file",
            CandidateKind::Dir => "dir",
        }
    }
}

/// "Resync this path". Applying a candidate twice has the same effect as
/// applying it once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncCandidate {
    pub kind: CandidateKind,
    /// Relative to the target's mirror root; empty for the root itself.
    pub relative_path: PathBuf,
    pub target_id: TargetId,
    pub discovered_at: SystemTime,
}

impl SyncCandidate {
    pub fn file(relative_path: impl Into<PathBuf>, target_id: TargetId) -> Self {
        Self::new(CandidateKind::File, relative_path.into(), target_id)
    }

    pub fn dir(relative_path: impl Into<PathBuf>, target_id: TargetId) -> Self {
        Self::new(CandidateKind::Dir, relative_path.into(), target_id)
    }

    fn new(kind: CandidateKind, relative_path: PathBuf, target_id: TargetId) -> Self {
        Self {
            kind,
            relative_path,
            target_id,
            discovered_at: SystemTime::now(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.relative_path
    }
}

#[derive(Default)]
struct Queue {
    items: VecDeque<SyncCandidate>,
    queued: HashSet<(TargetId, PathBuf)>,
}

impl Queue {
    /// Returns false when an unfetched candidate for the same path was
    /// merged instead.
    fn push(&mut self, candidate: SyncCandidate) -> bool {
        let key = (candidate.target_id, candidate.relative_path.clone());
        if !self.queued.insert(key) {
            return false;
        }
        self.items.push_back(candidate);
        true
    }

    fn pop(&mut self) -> Option<SyncCandidate> {
        let candidate = self.items.pop_front()?;
        self.queued
            .remove(&(candidate.target_id, candidate.relative_path.clone()));
        Some(candidate)
    }

    fn clear(&mut self) {
        self.items.clear();
        self.queued.clear();
    }
}

#[derive(Default)]
struct StoreInner {
    files: Queue,
    dirs: Queue,
    merged: u64,
}

impl StoreInner {
    fn queue(&mut self, kind: CandidateKind) -> &mut Queue {
        match kind {
            CandidateKind::File => &mut self.files,
            CandidateKind::Dir => &mut self.dirs,
        }
    }
}

/// Unbounded store-or-merge queue of candidates, one lane per kind.
///
/// `add` never drops a candidate: either it is queued or an identical
/// not-yet-fetched candidate already is.
#[derive(Default)]
pub struct SyncCandidateStore {
    inner: Mutex<StoreInner>,
    files_ready: Condvar,
    dirs_ready: Condvar,
}

impl SyncCandidateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, candidate: SyncCandidate) {
        let kind = candidate.kind;
        let mut inner = self.inner.lock();
        if inner.queue(kind).push(candidate) {
            drop(inner);
            self.condvar(kind).notify_one();
        } else {
            inner.merged += 1;
        }
    }

    pub fn fetch_file(&self, timeout: Duration) -> Option<SyncCandidate> {
        self.fetch(CandidateKind::File, timeout)
    }

    pub fn fetch_dir(&self, timeout: Duration) -> Option<SyncCandidate> {
        self.fetch(CandidateKind::Dir, timeout)
    }

    /// Waits at most `timeout` for a candidate of `kind`.
    pub fn fetch(&self, kind: CandidateKind, timeout: Duration) -> Option<SyncCandidate> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(candidate) = inner.queue(kind).pop() {
                return Some(candidate);
            }
            if self
                .condvar(kind)
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                return inner.queue(kind).pop();
            }
        }
    }

    pub fn is_files_empty(&self) -> bool {
        self.inner.lock().files.items.is_empty()
    }

    pub fn is_dirs_empty(&self) -> bool {
        self.inner.lock().dirs.items.is_empty()
    }

    pub fn is_empty(&self, kind: CandidateKind) -> bool {
        self.inner.lock().queue(kind).items.is_empty()
    }

    pub fn num_files(&self) -> usize {
        self.inner.lock().files.items.len()
    }

    pub fn num_dirs(&self) -> usize {
        self.inner.lock().dirs.items.len()
    }

    /// Candidates folded into an already queued entry.
    pub fn merged(&self) -> u64 {
        self.inner.lock().merged
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.files.clear();
        inner.dirs.clear();
    }

    /// Drain everything currently queued, files first.
    pub fn drain(&self) -> Vec<SyncCandidate> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.files.items.len() + inner.dirs.items.len());
        while let Some(candidate) = inner.files.pop() {
            out.push(candidate);
        }
        while let Some(candidate) = inner.dirs.pop() {
            out.push(candidate);
        }
        out
    }

    fn condvar(&self, kind: CandidateKind) -> &Condvar {
        match kind {
            CandidateKind::File => &self.files_ready,
            CandidateKind::Dir => &self.dirs_ready,
        }
    }
}
