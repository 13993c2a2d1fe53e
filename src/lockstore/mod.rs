//! Entry lock store: fine-grained exclusion for file ids, directory entry
//! names and hash directories.

mod hash;
mod plan;
mod table;

use std::fmt;

use parking_lot::{Mutex, RwLock};

pub use hash::{OneAtATime, one_at_a_time, pair_hash};
pub use plan::{HeldLock, HeldLocks, LockPlan, LockPlanError};
pub use table::{
    LockKey, LockMode, LockPayload, LockTable, LockTableConfig, LockTableStats, RwHeld, TableGuard,
};

use crate::core::EntryId;

impl LockKey for EntryId {
    fn bucket_hash(&self) -> u32 {
        one_at_a_time(self.as_bytes())
    }
}

/// Directory entry name within a parent directory.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParentNameKey {
    pub parent: EntryId,
    pub name: String,
}

impl ParentNameKey {
    pub fn new(parent: EntryId, name: impl Into<String>) -> Self {
        Self {
            parent,
            name: name.into(),
        }
    }
}

impl fmt::Debug for ParentNameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParentNameKey({}/{:?})", self.parent, self.name)
    }
}

impl LockKey for ParentNameKey {
    fn bucket_hash(&self) -> u32 {
        let mut hasher = OneAtATime::new();
        hasher.update(self.parent.as_bytes());
        hasher.update(self.name.as_bytes());
        hasher.finish()
    }
}

/// Two-level hash directory coordinate.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HashDirKey {
    pub level1: u16,
    pub level2: u16,
}

impl HashDirKey {
    pub const fn new(level1: u16, level2: u16) -> Self {
        Self { level1, level2 }
    }
}

impl fmt::Debug for HashDirKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashDirKey({:X}/{:X})", self.level1, self.level2)
    }
}

impl LockKey for HashDirKey {
    fn bucket_hash(&self) -> u32 {
        pair_hash(self.level1, self.level2)
    }
}

pub type FileIdLock<'a> = TableGuard<'a, EntryId, RwLock<()>>;
pub type ParentNameLock<'a> = TableGuard<'a, ParentNameKey, Mutex<()>>;
pub type HashDirLock<'a> = TableGuard<'a, HashDirKey, Mutex<()>>;

/// The three lock tables every mutating path goes through.
///
/// Callers that need more than one lock for a single operation should use
/// [`LockPlan`], which acquires in the canonical order.
pub struct EntryLockStore {
    file_ids: LockTable<EntryId, RwLock<()>>,
    parent_names: LockTable<ParentNameKey, Mutex<()>>,
    hash_dirs: LockTable<HashDirKey, Mutex<()>>,
}

impl EntryLockStore {
    pub fn new(config: LockTableConfig) -> Self {
        Self {
            file_ids: LockTable::new(config),
            parent_names: LockTable::new(config),
            hash_dirs: LockTable::new(config),
        }
    }

    pub fn lock_file_id(&self, id: &EntryId, mode: LockMode) -> FileIdLock<'_> {
        self.file_ids.lock(id, mode)
    }

    pub fn try_lock_file_id(&self, id: &EntryId, mode: LockMode) -> Option<FileIdLock<'_>> {
        self.file_ids.try_lock(id, mode)
    }

    pub fn lock_parent_name(&self, parent: &EntryId, name: &str) -> ParentNameLock<'_> {
        self.parent_names
            .lock(&ParentNameKey::new(parent.clone(), name), ())
    }

    pub fn lock_hash_dir(&self, level1: u16, level2: u16) -> HashDirLock<'_> {
        self.hash_dirs.lock(&HashDirKey::new(level1, level2), ())
    }

    pub fn file_id_stats(&self) -> LockTableStats {
        self.file_ids.stats()
    }

    pub fn parent_name_stats(&self) -> LockTableStats {
        self.parent_names.stats()
    }

    pub fn hash_dir_stats(&self) -> LockTableStats {
        self.hash_dirs.stats()
    }

    pub(crate) fn file_ids(&self) -> &LockTable<EntryId, RwLock<()>> {
        &self.file_ids
    }

    pub(crate) fn parent_names(&self) -> &LockTable<ParentNameKey, Mutex<()>> {
        &self.parent_names
    }

    pub(crate) fn hash_dirs(&self) -> &LockTable<HashDirKey, Mutex<()>> {
        &self.hash_dirs
    }
}

impl Default for EntryLockStore {
    fn default() -> Self {
        Self::new(LockTableConfig::default())
    }
}
