//! One resync run of a primary target towards its buddy.
//!
//! The job walks the mirror root down to `walk_depth` itself, emitting
//! candidates for shallow entries and queueing deeper subtrees for the
//! gather slaves. Sync slaves drain candidates concurrently. Gather slaves
//! are stopped before sync slaves so that every gathered candidate is
//! applied unless the job is aborted.
//!
//! Primary mutations made while the job runs arrive through the
//! [`ModificationLog`] on a separate lane, drained by the mod-sync slave.
//! That slave is stopped last, with the log quiesced, and its failures
//! count like any other sync error.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use thiserror::Error;
use walkdir::WalkDir;

use super::candidate::{CandidateKind, SyncCandidateStore};
use super::disk_store::XATTR_DIR;
use super::gather::{
    GatherSlave, GatherSlaveConfig, GatherStats, GatherStatsSnapshot, WalkContext,
};
use super::modsync::ModificationLog;
use super::sync_slave::{CandidateApplier, SyncSlave, SyncStatsSnapshot};
use super::watermark::Watermark;
use super::work_queue::GatherWorkQueue;
use crate::consistency::{BuddyCommError, BuddyCommFile, ConsistencyStates};
use crate::core::{ConsistencyState, ReachabilityState, TargetId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResyncJobState {
    NotStarted,
    Running,
    Success,
    Interrupted,
    Failure,
    Errors,
}

impl ResyncJobState {
    pub fn as_str(self) -> &'static str {
        match self {
            ResyncJobState::NotStarted => "not_started",
            ResyncJobState::Running => "running",
            ResyncJobState::Success => "success",
            ResyncJobState::Interrupted => "interrupted",
            ResyncJobState::Failure => "failure",
            ResyncJobState::Errors => "errors",
        }
    }
}

impl fmt::Display for ResyncJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ResyncJobError {
    #[error("resync of target {0} is already running")]
    AlreadyRunning(TargetId),
    #[error("mirror root {path:?} is not usable: {source}")]
    MirrorRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("mirror root {0:?} is not a directory")]
    NotADirectory(PathBuf),
    #[error(transparent)]
    BuddyComm(#[from] BuddyCommError),
    #[error("failed to spawn resync worker: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Clone, Debug)]
pub struct ResyncJobConfig {
    pub target_id: TargetId,
    pub buddy_target_id: TargetId,
    /// Mirrored content of the local target.
    pub root: PathBuf,
    pub safety_threshold_secs: u64,
    pub max_open_fds: usize,
    pub num_gather_slaves: usize,
    pub num_sync_slaves: usize,
    pub gather_queue_capacity: usize,
    pub walk_depth: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResyncJobStats {
    pub state: ResyncJobState,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub watermark: Watermark,
    pub gather: GatherStatsSnapshot,
    pub sync: SyncStatsSnapshot,
    /// Modifications made on the primary while the job ran.
    pub mod_sync: SyncStatsSnapshot,
    pub subtrees_queued: u64,
    pub candidates_merged: u64,
}

impl Default for ResyncJobStats {
    fn default() -> Self {
        Self {
            state: ResyncJobState::NotStarted,
            started_at: None,
            finished_at: None,
            watermark: Watermark::ZERO,
            gather: GatherStatsSnapshot::default(),
            sync: SyncStatsSnapshot::default(),
            mod_sync: SyncStatsSnapshot::default(),
            subtrees_queued: 0,
            candidates_merged: 0,
        }
    }
}

pub struct ResyncJob {
    config: ResyncJobConfig,
    states: Arc<dyn ConsistencyStates>,
    buddy_comm: Arc<BuddyCommFile>,
    applier: Arc<dyn CandidateApplier>,
    modifications: Arc<ModificationLog>,
    abort: Arc<AtomicBool>,
    stats: Mutex<ResyncJobStats>,
}

impl ResyncJob {
    pub fn new(
        config: ResyncJobConfig,
        states: Arc<dyn ConsistencyStates>,
        buddy_comm: Arc<BuddyCommFile>,
        applier: Arc<dyn CandidateApplier>,
    ) -> Self {
        Self {
            config,
            states,
            buddy_comm,
            applier,
            modifications: Arc::new(ModificationLog::new()),
            abort: Arc::new(AtomicBool::new(false)),
            stats: Mutex::new(ResyncJobStats::default()),
        }
    }

    /// Shares the log the target's executor records modifications in.
    pub fn with_modification_log(mut self, modifications: Arc<ModificationLog>) -> Self {
        self.modifications = modifications;
        self
    }

    pub fn modifications(&self) -> &Arc<ModificationLog> {
        &self.modifications
    }

    pub fn config(&self) -> &ResyncJobConfig {
        &self.config
    }

    pub fn state(&self) -> ResyncJobState {
        self.stats.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ResyncJobState::Running
    }

    pub fn stats(&self) -> ResyncJobStats {
        self.stats.lock().clone()
    }

    /// Stops a running job as soon as possible; queued work is dropped.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    /// Runs the job to completion on the calling thread and reports the
    /// outcome to the state store.
    pub fn run(&self) -> Result<ResyncJobState, ResyncJobError> {
        let target = self.config.target_id;
        {
            let mut stats = self.stats.lock();
            if stats.state == ResyncJobState::Running || self.states.is_resync_in_progress(target)
            {
                return Err(ResyncJobError::AlreadyRunning(target));
            }
            *stats = ResyncJobStats {
                state: ResyncJobState::Running,
                started_at: Some(SystemTime::now()),
                ..ResyncJobStats::default()
            };
        }
        self.abort.store(false, Ordering::Relaxed);
        // Attached before the target is marked running: an executor that
        // sees the flag always finds somewhere to put its modifications.
        let modified = Arc::new(SyncCandidateStore::new());
        self.modifications.attach(target, Arc::clone(&modified));
        self.states.set_resync_in_progress(target, true);
        tracing::info!(
            target_id = %target,
            buddy_target_id = %self.config.buddy_target_id,
            root = %self.config.root.display(),
            "resync started"
        );

        let mod_slave = SyncSlave::spawn(
            format!("resync-modsync-{target}"),
            CandidateKind::File,
            Arc::clone(&modified),
            Arc::clone(&self.applier),
        )
        .map_err(ResyncJobError::Spawn);
        let mut outcome = match &mod_slave {
            Ok(_) => self.execute(),
            Err(_) => Ok(ResyncJobState::Failure),
        };

        // New requests wait here until the outcome is published.
        let quiesced = self.modifications.quiesce();
        let aborted = self.abort.load(Ordering::Relaxed);
        let mod_sync = match mod_slave {
            Ok(slave) => {
                slave.only_terminate_if_idle(!aborted);
                slave.self_terminate();
                slave.join()
            }
            Err(err) => {
                outcome = Err(err);
                SyncStatsSnapshot::default()
            }
        };
        if aborted {
            modified.clear();
        }
        if mod_sync.errors > 0 && matches!(outcome, Ok(ResyncJobState::Success)) {
            outcome = Ok(ResyncJobState::Errors);
        }

        let state = match &outcome {
            Ok(state) => *state,
            Err(err) => {
                tracing::error!(target_id = %target, error = %err, "resync failed");
                ResyncJobState::Failure
            }
        };
        self.report(state);
        self.states.set_resync_in_progress(target, false);
        drop(quiesced);
        {
            let mut stats = self.stats.lock();
            stats.state = state;
            stats.mod_sync = mod_sync;
            stats.finished_at = Some(SystemTime::now());
            tracing::info!(
                target_id = %target,
                state = %state,
                dirs_matched = stats.gather.dirs_matched,
                chunks_matched = stats.gather.chunks_matched,
                synced = stats.sync.synced,
                modifications_synced = mod_sync.synced,
                errors = stats.gather.errors + stats.sync.errors + mod_sync.errors,
                "resync finished"
            );
        }
        outcome
    }

    fn execute(&self) -> Result<ResyncJobState, ResyncJobError> {
        let root = &self.config.root;
        let meta = std::fs::metadata(root).map_err(|source| ResyncJobError::MirrorRoot {
            path: root.clone(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(ResyncJobError::NotADirectory(root.clone()));
        }

        let last = self.buddy_comm.last_buddy_comm()?;
        let watermark = Watermark::compute(
            last.at,
            self.config.safety_threshold_secs,
            last.is_override,
        );
        self.stats.lock().watermark = watermark;
        tracing::debug!(
            target_id = %self.config.target_id,
            %watermark,
            is_override = last.is_override,
            "resync watermark"
        );

        let gather_config = Arc::new(GatherSlaveConfig {
            root: root.clone(),
            target_id: self.config.target_id,
            watermark,
            max_open_fds: self.config.max_open_fds,
        });
        let queue = Arc::new(GatherWorkQueue::new(self.config.gather_queue_capacity));
        let candidates = Arc::new(SyncCandidateStore::new());

        let mut gather_slaves = Vec::new();
        let mut sync_slaves = Vec::new();
        let spawned = self.spawn_slaves(
            &gather_config,
            &queue,
            &candidates,
            &mut gather_slaves,
            &mut sync_slaves,
        );

        let walk_stats = GatherStats::default();
        let mut subtrees_queued = 0;
        if spawned.is_ok() {
            subtrees_queued = self.walk_top(&gather_config, &queue, &candidates, &walk_stats);
        } else {
            self.abort();
        }
        let aborted = self.abort.load(Ordering::Relaxed);

        let mut gather = walk_stats.snapshot();
        for slave in &gather_slaves {
            slave.only_terminate_if_idle(!aborted);
            slave.self_terminate();
        }
        for slave in gather_slaves {
            gather += slave.join();
        }

        let aborted = self.abort.load(Ordering::Relaxed);
        let mut sync = SyncStatsSnapshot::default();
        for slave in &sync_slaves {
            slave.only_terminate_if_idle(!aborted);
            slave.self_terminate();
        }
        for slave in sync_slaves {
            sync += slave.join();
        }
        if aborted {
            queue.clear();
            candidates.clear();
        }

        {
            let mut stats = self.stats.lock();
            stats.gather = gather;
            stats.sync = sync;
            stats.subtrees_queued = subtrees_queued;
            stats.candidates_merged = candidates.merged();
        }
        spawned?;

        Ok(if self.abort.load(Ordering::Relaxed) {
            ResyncJobState::Interrupted
        } else if gather.errors + sync.errors > 0 {
            ResyncJobState::Errors
        } else {
            ResyncJobState::Success
        })
    }

    fn spawn_slaves(
        &self,
        gather_config: &Arc<GatherSlaveConfig>,
        queue: &Arc<GatherWorkQueue>,
        candidates: &Arc<SyncCandidateStore>,
        gather_slaves: &mut Vec<GatherSlave>,
        sync_slaves: &mut Vec<SyncSlave>,
    ) -> Result<(), ResyncJobError> {
        let target = self.config.target_id;
        for i in 0..self.config.num_gather_slaves.max(1) {
            gather_slaves.push(
                GatherSlave::spawn(
                    format!("resync-gather-{target}-{i}"),
                    Arc::clone(gather_config),
                    Arc::clone(queue),
                    Arc::clone(candidates),
                )
                .map_err(ResyncJobError::Spawn)?,
            );
        }
        let total = self.config.num_sync_slaves.max(2);
        let dir_slaves = (total / 2).max(1);
        for i in 0..total {
            let kind = if i < dir_slaves {
                CandidateKind::Dir
            } else {
                CandidateKind::File
            };
            sync_slaves.push(
                SyncSlave::spawn(
                    format!("resync-sync-{target}-{}-{i}", kind.as_str()),
                    kind,
                    Arc::clone(candidates),
                    Arc::clone(&self.applier),
                )
                .map_err(ResyncJobError::Spawn)?,
            );
        }
        Ok(())
    }

    /// Walks the top levels of the mirror root. Returns the number of
    /// subtrees handed to the gather slaves.
    fn walk_top(
        &self,
        config: &GatherSlaveConfig,
        queue: &GatherWorkQueue,
        candidates: &SyncCandidateStore,
        stats: &GatherStats,
    ) -> u64 {
        let ctx = WalkContext {
            config,
            stats,
            candidates,
        };
        let depth = self.config.walk_depth.max(1);
        let mut queued = 0;
        let walker = WalkDir::new(&config.root)
            .follow_links(false)
            .max_depth(depth)
            .max_open(config.max_open_fds.max(1))
            .into_iter()
            .filter_entry(|entry| !(entry.depth() == 1 && entry.file_name() == XATTR_DIR));
        for entry in walker {
            if self.abort.load(Ordering::Relaxed) {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    stats.record_error();
                    tracing::warn!(target_id = %config.target_id, error = %err, "resync walk error");
                    continue;
                }
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    stats.record_error();
                    tracing::warn!(path = %entry.path().display(), error = %err, "resync stat failed");
                    continue;
                }
            };
            let Ok(rel) = entry.path().strip_prefix(&config.root) else {
                continue;
            };
            if !meta.is_dir() {
                ctx.visit_file(rel, &meta);
            } else if entry.depth() < depth {
                ctx.visit_dir(rel, &meta);
            } else if queue.push(rel.to_path_buf(), &self.abort) {
                queued += 1;
            }
        }
        queued
    }

    /// Publishes the outcome: the buddy is GOOD only after a clean run.
    fn report(&self, state: ResyncJobState) {
        let buddy = self.config.buddy_target_id;
        match state {
            ResyncJobState::Success => {
                if let Err(err) = self.buddy_comm.clear_override() {
                    tracing::warn!(error = %err, "failed to clear last buddy comm override");
                }
                let buddy_offline =
                    self.states.reachability_state(buddy) == Some(ReachabilityState::Offline);
                if buddy_offline {
                    tracing::warn!(buddy_target_id = %buddy, "buddy went offline during resync");
                    self.states.set_buddy_needs_resync(buddy, true);
                    return;
                }
                if let Err(err) = self.buddy_comm.set_needs_resync(false) {
                    tracing::warn!(error = %err, "failed to clear buddy resync flag");
                }
                self.states
                    .set_consistency_state(buddy, ConsistencyState::Good);
            }
            ResyncJobState::Errors | ResyncJobState::Interrupted | ResyncJobState::Failure => {
                self.states.set_consistency_state(buddy, ConsistencyState::Bad);
            }
            ResyncJobState::NotStarted | ResyncJobState::Running => {}
        }
    }
}
