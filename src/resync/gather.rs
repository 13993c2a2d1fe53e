//! Gather slaves: walk subtrees and emit resync candidates.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use walkdir::WalkDir;

use super::candidate::{SyncCandidate, SyncCandidateStore};
use super::slave::{IDLE_WAIT, SlaveControl};
use super::watermark::Watermark;
use super::work_queue::GatherWorkQueue;
use crate::core::TargetId;

#[derive(Clone, Debug)]
pub struct GatherSlaveConfig {
    /// Mirror root of the target; queued paths are relative to it.
    pub root: PathBuf,
    pub target_id: TargetId,
    pub watermark: Watermark,
    pub max_open_fds: usize,
}

#[derive(Debug, Default)]
pub struct GatherStats {
    chunks_discovered: AtomicU64,
    chunks_matched: AtomicU64,
    dirs_discovered: AtomicU64,
    dirs_matched: AtomicU64,
    errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GatherStatsSnapshot {
    pub chunks_discovered: u64,
    pub chunks_matched: u64,
    pub dirs_discovered: u64,
    pub dirs_matched: u64,
    pub errors: u64,
}

impl std::ops::AddAssign for GatherStatsSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.chunks_discovered += other.chunks_discovered;
        self.chunks_matched += other.chunks_matched;
        self.dirs_discovered += other.dirs_discovered;
        self.dirs_matched += other.dirs_matched;
        self.errors += other.errors;
    }
}

impl GatherStats {
    pub fn snapshot(&self) -> GatherStatsSnapshot {
        GatherStatsSnapshot {
            chunks_discovered: self.chunks_discovered.load(Ordering::Relaxed),
            chunks_matched: self.chunks_matched.load(Ordering::Relaxed),
            dirs_discovered: self.dirs_discovered.load(Ordering::Relaxed),
            dirs_matched: self.dirs_matched.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything the walk needs; borrowed by the walk loop instead of being
/// looked up per entry.
pub(crate) struct WalkContext<'a> {
    pub config: &'a GatherSlaveConfig,
    pub stats: &'a GatherStats,
    pub candidates: &'a SyncCandidateStore,
}

impl WalkContext<'_> {
    /// Emits a directory candidate when its mtime is newer than the
    /// watermark.
    pub fn visit_dir(&self, rel: &Path, meta: &std::fs::Metadata) {
        self.stats.dirs_discovered.fetch_add(1, Ordering::Relaxed);
        if self.config.watermark.is_exceeded_by(meta.mtime()) {
            self.stats.dirs_matched.fetch_add(1, Ordering::Relaxed);
            self.candidates
                .add(SyncCandidate::dir(rel, self.config.target_id));
        }
    }

    /// Emits a file candidate when its ctime is newer than the watermark.
    /// Modification times are settable by users and are not trusted here.
    pub fn visit_file(&self, rel: &Path, meta: &std::fs::Metadata) {
        self.stats.chunks_discovered.fetch_add(1, Ordering::Relaxed);
        if self.config.watermark.is_exceeded_by(meta.ctime()) {
            self.stats.chunks_matched.fetch_add(1, Ordering::Relaxed);
            self.candidates
                .add(SyncCandidate::file(rel, self.config.target_id));
        }
    }

    fn relative<'p>(&self, path: &'p Path) -> Option<&'p Path> {
        path.strip_prefix(&self.config.root).ok()
    }

    /// Walks one queued subtree, including its root directory.
    fn walk(&self, subtree: &Path, control: &SlaveControl) {
        let walker = WalkDir::new(self.config.root.join(subtree))
            .follow_links(false)
            .max_open(self.config.max_open_fds.max(1));
        for entry in walker {
            if control.is_abandoning() {
                return;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    self.stats.record_error();
                    tracing::warn!(
                        target_id = %self.config.target_id,
                        error = %err,
                        "gather walk error"
                    );
                    continue;
                }
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    // Vanished between listing and stat.
                    if err.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) {
                        continue;
                    }
                    self.stats.record_error();
                    tracing::warn!(path = %entry.path().display(), error = %err, "gather stat failed");
                    continue;
                }
            };
            let Some(rel) = self.relative(entry.path()) else {
                continue;
            };
            if meta.is_dir() {
                self.visit_dir(rel, &meta);
            } else {
                self.visit_file(rel, &meta);
            }
        }
    }
}

pub struct GatherSlave {
    name: String,
    control: Arc<SlaveControl>,
    stats: Arc<GatherStats>,
    join: JoinHandle<()>,
}

impl GatherSlave {
    pub fn spawn(
        name: impl Into<String>,
        config: Arc<GatherSlaveConfig>,
        queue: Arc<GatherWorkQueue>,
        candidates: Arc<SyncCandidateStore>,
    ) -> io::Result<Self> {
        let name = name.into();
        let control = Arc::new(SlaveControl::new());
        let stats = Arc::new(GatherStats::default());
        let join = {
            let control = Arc::clone(&control);
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || run_gather(&config, &queue, &candidates, &control, &stats))?
        };
        Ok(Self {
            name,
            control,
            stats,
            join,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn self_terminate(&self) {
        self.control.self_terminate();
    }

    pub fn only_terminate_if_idle(&self, only_if_idle: bool) {
        self.control.only_terminate_if_idle(only_if_idle);
    }

    pub fn stats(&self) -> GatherStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn join(self) -> GatherStatsSnapshot {
        if self.join.join().is_err() {
            tracing::error!(slave = %self.name, "gather slave panicked");
            self.stats.record_error();
        }
        self.stats.snapshot()
    }
}

fn run_gather(
    config: &GatherSlaveConfig,
    queue: &GatherWorkQueue,
    candidates: &SyncCandidateStore,
    control: &SlaveControl,
    stats: &GatherStats,
) {
    let ctx = WalkContext {
        config,
        stats,
        candidates,
    };
    tracing::debug!(target_id = %config.target_id, "gather slave started");
    loop {
        if control.should_exit(queue.is_empty()) {
            break;
        }
        let Some(subtree) = queue.pop(IDLE_WAIT) else {
            continue;
        };
        ctx.walk(&subtree, control);
    }
    tracing::debug!(target_id = %config.target_id, "gather slave stopped");
}
