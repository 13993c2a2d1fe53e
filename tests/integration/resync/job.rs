//! A full resync job streaming a primary tree to the secondary.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use buddymirror::config::Config;
use buddymirror::consistency::{BuddyCommFile, ConsistencyStates, TargetStateStore};
use buddymirror::core::layout::ROOT_DIR_ID;
use buddymirror::core::{
    BuddyGroupId, BuddyGroupMapper, CombinedTargetState, ConsistencyState, EntryId,
    MirrorBuddyGroup, NodeId, OpsErr, ReachabilityState, TargetId,
};
use buddymirror::lockstore::EntryLockStore;
use buddymirror::mirror::{
    CloseFile, ForwardVerdict, MetaStore, MirrorExecutor, MirrorExecutorConfig, MirrorOutcome,
    MirrorResponse, MkFile, RequestMeta, SkipReason, TargetRoutes, UnlinkFile,
};
use buddymirror::resync::{
    CandidateApplier, ModificationLog, RawMetaSource, ResyncJob, ResyncJobConfig, ResyncJobState,
    StreamCandidateApplier, SyncCandidate,
};
use buddymirror::test_harness::ScriptedMessenger;

use crate::fixtures::resync_rig::ResyncRig;

const PRIMARY: TargetId = TargetId::new(1);
const SECONDARY: TargetId = TargetId::new(2);
const CLIENT: NodeId = NodeId::new(100);

fn mirrored_entries(entries: Vec<PathBuf>) -> Vec<PathBuf> {
    entries
        .into_iter()
        .filter(|path| !path.starts_with(".xattrs"))
        .collect()
}

#[test]
fn job_mirrors_the_primary_and_marks_the_buddy_good() {
    let rig = ResyncRig::start();
    rig.primary_tree()
        .file("top", b"t")
        .file("d1/x", b"x")
        .file("d1/sub/y", b"y")
        .file("d2/deep/er/z", b"z");
    rig.secondary_tree()
        .file("stale_root", b"s")
        .file("d1/stale", b"s")
        .file("d1/x", b"outdated");

    let states = Arc::new(TargetStateStore::new());
    states.insert(
        PRIMARY,
        CombinedTargetState::new(ReachabilityState::Online, ConsistencyState::Good),
    );
    states.insert(
        SECONDARY,
        CombinedTargetState::new(ReachabilityState::Online, ConsistencyState::NeedsResync),
    );
    let comm_dir = tempfile::tempdir().unwrap();
    let buddy_comm = Arc::new(BuddyCommFile::new(comm_dir.path()));
    buddy_comm.set_needs_resync(true).unwrap();

    let source: Arc<dyn RawMetaSource> = rig.primary.clone();
    let applier = Arc::new(StreamCandidateApplier::new(
        source,
        Arc::new(EntryLockStore::new(Config::default().lock_table_config())),
        rig.sender_config(false),
    ));
    let job = ResyncJob::new(
        ResyncJobConfig {
            target_id: PRIMARY,
            buddy_target_id: SECONDARY,
            root: rig.primary_root().to_path_buf(),
            safety_threshold_secs: 0,
            max_open_fds: 8,
            num_gather_slaves: 2,
            num_sync_slaves: 2,
            gather_queue_capacity: 16,
            walk_depth: 2,
        },
        states.clone(),
        buddy_comm.clone(),
        applier,
    );

    assert_eq!(job.run().unwrap(), ResyncJobState::Success);

    let stats = job.stats();
    assert_eq!(stats.state, ResyncJobState::Success);
    assert_eq!(stats.subtrees_queued, 2);
    assert_eq!(stats.gather.errors + stats.sync.errors, 0);
    assert!(stats.finished_at.is_some());

    assert_eq!(
        mirrored_entries(rig.secondary_tree().entries()),
        mirrored_entries(rig.primary_tree().entries())
    );
    let secondary = rig.secondary_tree();
    assert_eq!(std::fs::read(secondary.path("d1/x")).unwrap(), b"x");
    assert_eq!(std::fs::read(secondary.path("d2/deep/er/z")).unwrap(), b"z");
    assert!(!secondary.path("stale_root").exists());
    assert!(!secondary.path("d1/stale").exists());

    assert_eq!(
        states.consistency_state(SECONDARY),
        Some(ConsistencyState::Good)
    );
    assert!(!states.is_resync_in_progress(PRIMARY));
    assert!(!buddy_comm.needs_resync().unwrap());
}

/// Applies mirrored operations on the primary while the first candidate is
/// being synced, then streams candidates as usual.
struct MutateDuringRun {
    executor: Arc<MirrorExecutor>,
    inner: StreamCandidateApplier,
    mutated: AtomicBool,
    verdicts: Mutex<Vec<ForwardVerdict>>,
}

impl CandidateApplier for MutateDuringRun {
    fn apply(&self, candidate: &SyncCandidate) -> Result<(), OpsErr> {
        if !self.mutated.swap(true, Ordering::SeqCst) {
            let root = EntryId::new(ROOT_DIR_ID);
            let mut create = MkFile {
                parent: root.clone(),
                name: "late".to_string(),
                entry_id: EntryId::new("f-late"),
                mirrored: true,
            };
            let mut unlink = UnlinkFile {
                parent: root,
                name: "early".to_string(),
                mirrored: true,
            };
            for outcome in [
                executed(self.executor.process(&mut create, &RequestMeta::new(CLIENT))),
                executed(self.executor.process(&mut unlink, &RequestMeta::new(CLIENT))),
            ] {
                self.verdicts.lock().push(outcome);
            }
        }
        self.inner.apply(candidate)
    }
}

fn executed<R: std::fmt::Debug>(outcome: MirrorOutcome<R>) -> ForwardVerdict {
    match outcome {
        MirrorOutcome::Executed { verdict, .. } => verdict,
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn mutations_during_the_job_reach_the_buddy_before_it_turns_good() {
    let rig = ResyncRig::start();
    let root = EntryId::new(ROOT_DIR_ID);
    rig.primary
        .create_file(&root, "early", &EntryId::new("f-early"))
        .unwrap();
    rig.primary
        .create_file(&root, "kept", &EntryId::new("f-kept"))
        .unwrap();

    let states = Arc::new(TargetStateStore::new());
    states.insert(
        PRIMARY,
        CombinedTargetState::new(ReachabilityState::Online, ConsistencyState::Good),
    );
    states.insert(
        SECONDARY,
        CombinedTargetState::new(ReachabilityState::Online, ConsistencyState::NeedsResync),
    );
    let groups = Arc::new(BuddyGroupMapper::new());
    let group = BuddyGroupId::new(1);
    groups
        .add_group(group, MirrorBuddyGroup::new(PRIMARY, SECONDARY))
        .unwrap();
    groups.set_local_group(Some(group));
    let routes = Arc::new(TargetRoutes::new());
    routes.set_route(SECONDARY, NodeId::new(20));

    let comm_dir = tempfile::tempdir().unwrap();
    let buddy_comm = Arc::new(BuddyCommFile::new(comm_dir.path()));
    let locks = Arc::new(EntryLockStore::new(Config::default().lock_table_config()));
    let modifications = Arc::new(ModificationLog::new());
    let messenger = Arc::new(ScriptedMessenger::new());
    let executor = Arc::new(MirrorExecutor::new(MirrorExecutorConfig {
        local_target: PRIMARY,
        groups,
        states: states.clone(),
        buddy_comm: Arc::clone(&buddy_comm),
        locks: Arc::clone(&locks),
        messenger: messenger.clone(),
        meta: rig.primary.clone(),
        routes,
        modifications: Arc::clone(&modifications),
    }));

    let source: Arc<dyn RawMetaSource> = rig.primary.clone();
    let applier = Arc::new(MutateDuringRun {
        executor: Arc::clone(&executor),
        inner: StreamCandidateApplier::new(source, locks, rig.sender_config(false)),
        mutated: AtomicBool::new(false),
        verdicts: Mutex::new(Vec::new()),
    });
    let job = ResyncJob::new(
        ResyncJobConfig {
            target_id: PRIMARY,
            buddy_target_id: SECONDARY,
            root: rig.primary_root().to_path_buf(),
            safety_threshold_secs: 0,
            max_open_fds: 8,
            num_gather_slaves: 2,
            num_sync_slaves: 2,
            gather_queue_capacity: 16,
            walk_depth: 2,
        },
        states.clone(),
        buddy_comm.clone(),
        applier.clone(),
    )
    .with_modification_log(Arc::clone(&modifications));

    assert_eq!(job.run().unwrap(), ResyncJobState::Success);

    assert_eq!(
        *applier.verdicts.lock(),
        vec![
            ForwardVerdict::NotForwarded(SkipReason::ResyncInProgress),
            ForwardVerdict::NotForwarded(SkipReason::ResyncInProgress),
        ]
    );
    assert!(messenger.sent().is_empty());
    let stats = job.stats();
    assert_eq!(stats.mod_sync.errors, 0);
    assert_eq!(stats.mod_sync.synced, 4);

    assert_eq!(
        mirrored_entries(rig.secondary_tree().entries()),
        mirrored_entries(rig.primary_tree().entries())
    );
    assert_eq!(
        rig.secondary.lookup(&root, "late").unwrap(),
        Some(EntryId::new("f-late"))
    );
    assert_eq!(rig.secondary.lookup(&root, "early").unwrap(), None);
    assert!(!rig.secondary_tree().path("inodes/f-early").exists());
    assert_eq!(
        states.consistency_state(SECONDARY),
        Some(ConsistencyState::Good)
    );
    assert!(!modifications.is_tracking());

    // The buddy is good again: the next mutation is forwarded.
    let mut close = CloseFile {
        entry_id: EntryId::new("f-kept"),
        mirrored: true,
    };
    messenger.push(Some(MirrorResponse::new(OpsErr::Success)));
    let verdict = executed(executor.process(&mut close, &RequestMeta::new(CLIENT)));
    assert_eq!(verdict, ForwardVerdict::Acked);
}
