use std::sync::Arc;

use buddymirror::config::Config;
use buddymirror::consistency::{BuddyCommFile, TargetStateStore};
use buddymirror::core::{
    BuddyGroupId, BuddyGroupMapper, CombinedTargetState, ConsistencyState, MirrorBuddyGroup,
    NodeId, OpsErr, ReachabilityState, TargetId,
};
use buddymirror::lockstore::EntryLockStore;
use buddymirror::mirror::{
    MetaRequestHandler, MirrorExecutor, MirrorExecutorConfig, MirrorRequest, MirrorResponse,
    RequestHandler, TargetRoutes,
};
use buddymirror::resync::ModificationLog;
use buddymirror::test_harness::{LoopbackMessenger, MemMetaStore, ScriptedMessenger};

pub const PRIMARY: TargetId = TargetId::new(1);
pub const SECONDARY: TargetId = TargetId::new(2);
pub const PRIMARY_NODE: NodeId = NodeId::new(10);
pub const SECONDARY_NODE: NodeId = NodeId::new(20);
pub const CLIENT: NodeId = NodeId::new(100);

/// Answers every forwarded request with the same result.
pub struct FixedReply(pub OpsErr);

impl RequestHandler for FixedReply {
    fn handle(&self, _request: MirrorRequest) -> MirrorResponse {
        MirrorResponse::new(self.0)
    }
}

/// A primary and a secondary executor, each with its own metadata and
/// lock store, joined by a loopback messenger.
pub struct MirrorPair {
    _dirs: (tempfile::TempDir, tempfile::TempDir),
    pub states: Arc<TargetStateStore>,
    pub messenger: Arc<LoopbackMessenger>,
    pub primary: Arc<MirrorExecutor>,
    pub primary_meta: Arc<MemMetaStore>,
    pub primary_comm: Arc<BuddyCommFile>,
    pub primary_locks: Arc<EntryLockStore>,
    pub modifications: Arc<ModificationLog>,
    pub secondary: Arc<MirrorExecutor>,
    pub secondary_meta: Arc<MemMetaStore>,
}

impl MirrorPair {
    pub fn new() -> Self {
        let primary_dir = tempfile::tempdir().expect("tempdir");
        let secondary_dir = tempfile::tempdir().expect("tempdir");
        let lock_config = Config::default().lock_table_config();

        let groups = Arc::new(BuddyGroupMapper::new());
        let group = BuddyGroupId::new(1);
        groups
            .add_group(group, MirrorBuddyGroup::new(PRIMARY, SECONDARY))
            .expect("add group");
        groups.set_local_group(Some(group));

        let states = Arc::new(TargetStateStore::new());
        for target in [PRIMARY, SECONDARY] {
            states.insert(
                target,
                CombinedTargetState::new(ReachabilityState::Online, ConsistencyState::Good),
            );
        }
        let routes = Arc::new(TargetRoutes::new());
        routes.set_route(PRIMARY, PRIMARY_NODE);
        routes.set_route(SECONDARY, SECONDARY_NODE);
        let messenger = Arc::new(LoopbackMessenger::new());

        let secondary_meta = Arc::new(MemMetaStore::new());
        let secondary = Arc::new(MirrorExecutor::new(MirrorExecutorConfig {
            local_target: SECONDARY,
            groups: Arc::clone(&groups),
            states: states.clone(),
            buddy_comm: Arc::new(BuddyCommFile::new(secondary_dir.path())),
            locks: Arc::new(EntryLockStore::new(lock_config)),
            // Secondaries never forward.
            messenger: Arc::new(ScriptedMessenger::new()),
            meta: secondary_meta.clone(),
            routes: Arc::clone(&routes),
            modifications: Arc::new(ModificationLog::new()),
        }));

        let primary_meta = Arc::new(MemMetaStore::new());
        let primary_comm = Arc::new(BuddyCommFile::new(primary_dir.path()));
        let primary_locks = Arc::new(EntryLockStore::new(lock_config));
        let modifications = Arc::new(ModificationLog::new());
        let primary = Arc::new(MirrorExecutor::new(MirrorExecutorConfig {
            local_target: PRIMARY,
            groups,
            states: states.clone(),
            buddy_comm: Arc::clone(&primary_comm),
            locks: Arc::clone(&primary_locks),
            messenger: messenger.clone(),
            meta: primary_meta.clone(),
            routes,
            modifications: Arc::clone(&modifications),
        }));

        messenger.connect(
            SECONDARY_NODE,
            Arc::new(MetaRequestHandler::new(Arc::clone(&secondary))),
        );

        Self {
            _dirs: (primary_dir, secondary_dir),
            states,
            messenger,
            primary,
            primary_meta,
            primary_comm,
            primary_locks,
            modifications,
            secondary,
            secondary_meta,
        }
    }

    /// Replaces the secondary with a handler that always answers `result`.
    pub fn secondary_replies(&self, result: OpsErr) {
        self.messenger
            .connect(SECONDARY_NODE, Arc::new(FixedReply(result)));
    }
}
