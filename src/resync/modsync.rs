//! Modifications made while a resync runs.
//!
//! Every mirrored request enters the log before it takes entry locks. While
//! a job is attached, the paths a primary mutation touched are queued on the
//! job's modification lane instead of being forwarded. Before the job
//! reports, it quiesces the log: new requests wait until the report is
//! published, so nothing lands between the last drain and the buddy turning
//! GOOD.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::candidate::{SyncCandidate, SyncCandidateStore};
use crate::core::TargetId;

struct Sink {
    target_id: TargetId,
    candidates: Arc<SyncCandidateStore>,
}

#[derive(Default)]
pub struct ModificationLog {
    sink: RwLock<Option<Sink>>,
}

impl ModificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Held for the duration of one request.
    pub fn enter(&self) -> ModificationGuard<'_> {
        ModificationGuard {
            sink: self.sink.read(),
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.sink.read().is_some()
    }

    /// Routes modifications to `candidates` until the log is quiesced.
    pub fn attach(&self, target_id: TargetId, candidates: Arc<SyncCandidateStore>) {
        *self.sink.write() = Some(Sink {
            target_id,
            candidates,
        });
    }

    /// Detaches the job and holds off new requests until the guard drops.
    pub fn quiesce(&self) -> Quiesced<'_> {
        let mut sink = self.sink.write();
        *sink = None;
        Quiesced { _sink: sink }
    }
}

pub struct ModificationGuard<'a> {
    sink: RwLockReadGuard<'a, Option<Sink>>,
}

impl ModificationGuard<'_> {
    pub fn is_tracking(&self) -> bool {
        self.sink.is_some()
    }

    /// Queues `paths` on the running job. Returns `false` when no job is
    /// attached.
    pub fn record(&self, paths: &[PathBuf]) -> bool {
        let Some(sink) = self.sink.as_ref() else {
            return false;
        };
        for path in paths {
            sink.candidates
                .add(SyncCandidate::file(path.clone(), sink.target_id));
        }
        tracing::trace!(target_id = %sink.target_id, count = paths.len(), "modifications queued");
        true
    }
}

#[must_use]
pub struct Quiesced<'a> {
    _sink: RwLockWriteGuard<'a, Option<Sink>>,
}
