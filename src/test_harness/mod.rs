//! In-process collaborators for unit and integration tests.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};

use crate::core::{EntryId, NodeId, OpsErr};
use crate::mirror::{MetaStore, Messenger, MirrorRequest, MirrorResponse, RequestHandler};

#[derive(Debug, Default)]
struct MemMetaState {
    dentries: BTreeMap<(EntryId, String), EntryId>,
    open_counts: BTreeMap<EntryId, u32>,
}

/// Flat in-memory metadata: dentries plus per-inode open counts.
#[derive(Debug, Default)]
pub struct MemMetaStore {
    state: Mutex<MemMetaState>,
}

impl MemMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dentry as `(parent, name) -> entry`.
    pub fn dentries(&self) -> BTreeMap<(EntryId, String), EntryId> {
        self.state.lock().dentries.clone()
    }

    pub fn open_count(&self, entry: &EntryId) -> Option<u32> {
        self.state.lock().open_counts.get(entry).copied()
    }
}

impl MetaStore for MemMetaStore {
    fn lookup(&self, parent: &EntryId, name: &str) -> Result<Option<EntryId>, OpsErr> {
        let state = self.state.lock();
        Ok(state
            .dentries
            .get(&(parent.clone(), name.to_string()))
            .cloned())
    }

    fn create_file(&self, parent: &EntryId, name: &str, entry: &EntryId) -> Result<(), OpsErr> {
        let mut state = self.state.lock();
        let key = (parent.clone(), name.to_string());
        if state.dentries.contains_key(&key) {
            return Err(OpsErr::Exists);
        }
        state.dentries.insert(key, entry.clone());
        state.open_counts.entry(entry.clone()).or_insert(0);
        Ok(())
    }

    fn unlink_file(&self, parent: &EntryId, name: &str) -> Result<EntryId, OpsErr> {
        self.state
            .lock()
            .dentries
            .remove(&(parent.clone(), name.to_string()))
            .ok_or(OpsErr::PathNotExists)
    }

    fn open_file(&self, entry: &EntryId) -> Result<u32, OpsErr> {
        let mut state = self.state.lock();
        let count = state
            .open_counts
            .get_mut(entry)
            .ok_or(OpsErr::PathNotExists)?;
        *count += 1;
        Ok(*count)
    }

    fn close_file(&self, entry: &EntryId) -> Result<u32, OpsErr> {
        let mut state = self.state.lock();
        let count = state
            .open_counts
            .get_mut(entry)
            .ok_or(OpsErr::PathNotExists)?;
        *count = count.saturating_sub(1);
        Ok(*count)
    }
}

type Reply = Box<dyn FnOnce() -> Option<MirrorResponse> + Send>;

/// Answers forwards from a queue of canned replies. An empty queue behaves
/// like a failed round trip.
#[derive(Default)]
pub struct ScriptedMessenger {
    replies: Mutex<VecDeque<Reply>>,
    sent: Mutex<Vec<(NodeId, MirrorRequest)>>,
}

impl ScriptedMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: Option<MirrorResponse>) {
        self.replies.lock().push_back(Box::new(move || reply));
    }

    /// Queues a reply computed when the forward arrives, e.g. to flip target
    /// state mid-flight.
    pub fn push_with(&self, reply: impl FnOnce() -> Option<MirrorResponse> + Send + 'static) {
        self.replies.lock().push_back(Box::new(reply));
    }

    pub fn sent(&self) -> Vec<(NodeId, MirrorRequest)> {
        self.sent.lock().clone()
    }
}

impl Messenger for ScriptedMessenger {
    fn request_response(&self, node: NodeId, request: &MirrorRequest) -> Option<MirrorResponse> {
        self.sent.lock().push((node, request.clone()));
        let reply = self.replies.lock().pop_front()?;
        reply()
    }
}

/// Delivers forwards straight to an in-process handler, usually a
/// [`crate::mirror::MetaRequestHandler`] around the secondary's executor.
#[derive(Default)]
pub struct LoopbackMessenger {
    peers: RwLock<BTreeMap<NodeId, Arc<dyn RequestHandler>>>,
    failing: AtomicBool,
    sent: Mutex<Vec<(NodeId, MirrorRequest)>>,
}

impl LoopbackMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, node: NodeId, handler: Arc<dyn RequestHandler>) {
        self.peers.write().insert(node, handler);
    }

    pub fn disconnect(&self, node: NodeId) {
        self.peers.write().remove(&node);
    }

    /// While set, every round trip fails before reaching the peer.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(NodeId, MirrorRequest)> {
        self.sent.lock().clone()
    }
}

impl Messenger for LoopbackMessenger {
    fn request_response(&self, node: NodeId, request: &MirrorRequest) -> Option<MirrorResponse> {
        self.sent.lock().push((node, request.clone()));
        if self.failing.load(Ordering::SeqCst) {
            return None;
        }
        let handler = self.peers.read().get(&node).cloned()?;
        Some(handler.handle(request.clone()))
    }
}

/// Builds directory trees for gather and resync tests.
pub struct ChunkTree {
    root: PathBuf,
}

impl ChunkTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    pub fn dir(&self, rel: impl AsRef<Path>) -> &Self {
        fs::create_dir_all(self.path(rel)).expect("create dir");
        self
    }

    pub fn file(&self, rel: impl AsRef<Path>, data: &[u8]) -> &Self {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, data).expect("write file");
        self
    }

    /// Backdates the mtime of `rel` by `age`. Call after populating a
    /// directory; adding entries bumps its mtime again.
    pub fn age(&self, rel: impl AsRef<Path>, age: Duration) -> &Self {
        set_mtime(&self.path(rel), SystemTime::now() - age);
        self
    }

    /// Every entry below the root, relative, sorted.
    pub fn entries(&self) -> Vec<PathBuf> {
        let mut entries: Vec<PathBuf> = walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.root)
                    .ok()
                    .map(Path::to_path_buf)
            })
            .collect();
        entries.sort();
        entries
    }
}

pub fn set_mtime(path: &Path, when: SystemTime) {
    File::open(path)
        .and_then(|file| file.set_modified(when))
        .expect("set mtime");
}
