//! Sync slaves: hand gathered candidates to an applier.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use super::candidate::{CandidateKind, SyncCandidate, SyncCandidateStore};
use super::slave::{IDLE_WAIT, SlaveControl};
use crate::core::OpsErr;

/// Brings one candidate in sync on the buddy.
pub trait CandidateApplier: Send + Sync {
    fn apply(&self, candidate: &SyncCandidate) -> Result<(), OpsErr>;
}

#[derive(Debug, Default)]
struct SyncStats {
    synced: AtomicU64,
    errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStatsSnapshot {
    pub synced: u64,
    pub errors: u64,
}

impl std::ops::AddAssign for SyncStatsSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.synced += other.synced;
        self.errors += other.errors;
    }
}

impl SyncStats {
    fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            synced: self.synced.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

pub struct SyncSlave {
    name: String,
    kind: CandidateKind,
    control: Arc<SlaveControl>,
    stats: Arc<SyncStats>,
    join: JoinHandle<()>,
}

impl SyncSlave {
    /// Spawns a worker draining the `kind` lane of `candidates`.
    pub fn spawn(
        name: impl Into<String>,
        kind: CandidateKind,
        candidates: Arc<SyncCandidateStore>,
        applier: Arc<dyn CandidateApplier>,
    ) -> io::Result<Self> {
        let name = name.into();
        let control = Arc::new(SlaveControl::new());
        let stats = Arc::new(SyncStats::default());
        let join = {
            let control = Arc::clone(&control);
            let stats = Arc::clone(&stats);
            thread::Builder::new().name(name.clone()).spawn(move || {
                run_sync(kind, &candidates, applier.as_ref(), &control, &stats)
            })?
        };
        Ok(Self {
            name,
            kind,
            control,
            stats,
            join,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CandidateKind {
        self.kind
    }

    pub fn self_terminate(&self) {
        self.control.self_terminate();
    }

    pub fn only_terminate_if_idle(&self, only_if_idle: bool) {
        self.control.only_terminate_if_idle(only_if_idle);
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn join(self) -> SyncStatsSnapshot {
        if self.join.join().is_err() {
            tracing::error!(slave = %self.name, "sync slave panicked");
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.snapshot()
    }
}

fn run_sync(
    kind: CandidateKind,
    candidates: &SyncCandidateStore,
    applier: &dyn CandidateApplier,
    control: &SlaveControl,
    stats: &SyncStats,
) {
    loop {
        if control.should_exit(candidates.is_empty(kind)) {
            break;
        }
        let Some(candidate) = candidates.fetch(kind, IDLE_WAIT) else {
            continue;
        };
        match applier.apply(&candidate) {
            Ok(()) => {
                stats.synced.fetch_add(1, Ordering::Relaxed);
            }
            // The job is being aborted; it reports the interruption itself.
            Err(OpsErr::Interrupted) => {}
            Err(err) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    target_id = %candidate.target_id,
                    path = %candidate.path().display(),
                    kind = kind.as_str(),
                    error = %err,
                    "resync candidate failed"
                );
            }
        }
    }
}
