//! Canonical multi-lock acquisition.
//!
//! An operation lists every key it needs and [`LockPlan::acquire`] takes them
//! in one fixed order: hash dirs, then directory ids, then parent/name pairs,
//! then file ids. Within a class keys are taken in sorted order. Any two
//! operations built from plans therefore never wait on each other in a cycle.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use super::{
    EntryLockStore, FileIdLock, HashDirKey, HashDirLock, LockMode, ParentNameKey, ParentNameLock,
};
use crate::core::EntryId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockPlanError {
    #[error("lock plan contains an empty entry id")]
    EmptyEntryId,
    #[error("lock plan contains an empty name under parent {parent}")]
    EmptyName { parent: EntryId },
}

#[derive(Clone, Debug, Default)]
pub struct LockPlan {
    hash_dirs: BTreeSet<HashDirKey>,
    dir_ids: BTreeMap<EntryId, LockMode>,
    parent_names: BTreeSet<ParentNameKey>,
    file_ids: BTreeMap<EntryId, LockMode>,
}

impl LockPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hash_dir(mut self, level1: u16, level2: u16) -> Self {
        self.hash_dirs.insert(HashDirKey::new(level1, level2));
        self
    }

    /// Lock a directory's own id. Directory ids share the file id table but
    /// are taken before any name lock.
    pub fn dir_id(mut self, id: EntryId, mode: LockMode) -> Self {
        merge_mode(&mut self.dir_ids, id, mode);
        self
    }

    pub fn parent_name(mut self, parent: EntryId, name: impl Into<String>) -> Self {
        self.parent_names.insert(ParentNameKey::new(parent, name));
        self
    }

    pub fn file_id(mut self, id: EntryId, mode: LockMode) -> Self {
        merge_mode(&mut self.file_ids, id, mode);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hash_dirs.is_empty()
            && self.dir_ids.is_empty()
            && self.parent_names.is_empty()
            && self.file_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hash_dirs.len() + self.dir_ids.len() + self.parent_names.len() + self.file_ids.len()
    }

    /// Acquire every lock in canonical order. Locks are released in reverse
    /// order when the returned set drops.
    pub fn acquire(mut self, store: &EntryLockStore) -> Result<HeldLocks<'_>, LockPlanError> {
        self.validate()?;
        self.fold_duplicate_ids();

        let mut held = HeldLocks {
            locks: Vec::with_capacity(self.len()),
        };
        for key in &self.hash_dirs {
            held.locks
                .push(HeldLock::HashDir(store.hash_dirs().lock(key, ())));
        }
        for (id, mode) in &self.dir_ids {
            held.locks
                .push(HeldLock::DirId(store.file_ids().lock(id, *mode)));
        }
        for key in &self.parent_names {
            held.locks
                .push(HeldLock::ParentName(store.parent_names().lock(key, ())));
        }
        for (id, mode) in &self.file_ids {
            held.locks
                .push(HeldLock::FileId(store.file_ids().lock(id, *mode)));
        }
        Ok(held)
    }

    fn validate(&self) -> Result<(), LockPlanError> {
        let ids = self.dir_ids.keys().chain(self.file_ids.keys());
        for id in ids {
            if id.as_str().is_empty() {
                return Err(LockPlanError::EmptyEntryId);
            }
        }
        for key in &self.parent_names {
            if key.parent.as_str().is_empty() {
                return Err(LockPlanError::EmptyEntryId);
            }
            if key.name.is_empty() {
                return Err(LockPlanError::EmptyName {
                    parent: key.parent.clone(),
                });
            }
        }
        Ok(())
    }

    /// The same id requested as directory and as file would lock the same
    /// descriptor twice; keep it in the earlier class with the stronger mode.
    fn fold_duplicate_ids(&mut self) {
        let shared: Vec<EntryId> = self
            .file_ids
            .keys()
            .filter(|id| self.dir_ids.contains_key(*id))
            .cloned()
            .collect();
        for id in shared {
            if let Some(mode) = self.file_ids.remove(&id) {
                merge_mode(&mut self.dir_ids, id, mode);
            }
        }
    }
}

fn merge_mode(map: &mut BTreeMap<EntryId, LockMode>, id: EntryId, mode: LockMode) {
    map.entry(id)
        .and_modify(|current| *current = current.strongest(mode))
        .or_insert(mode);
}

#[derive(Debug)]
pub enum HeldLock<'a> {
    HashDir(HashDirLock<'a>),
    DirId(FileIdLock<'a>),
    ParentName(ParentNameLock<'a>),
    FileId(FileIdLock<'a>),
}

/// Locks acquired by a [`LockPlan`].
#[derive(Debug, Default)]
#[must_use = "locks are released as soon as the set is dropped"]
pub struct HeldLocks<'a> {
    locks: Vec<HeldLock<'a>>,
}

impl<'a> HeldLocks<'a> {
    pub fn none() -> Self {
        Self { locks: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeldLock<'a>> {
        self.locks.iter()
    }
}

impl Drop for HeldLocks<'_> {
    fn drop(&mut self) {
        while let Some(lock) = self.locks.pop() {
            drop(lock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn id(raw: &str) -> EntryId {
        EntryId::new(raw)
    }

    #[test]
    fn acquire_orders_classes_and_keys() {
        let store = EntryLockStore::default();
        let held = LockPlan::new()
            .file_id(id("f2"), LockMode::Write)
            .parent_name(id("d1"), "b")
            .file_id(id("f1"), LockMode::Read)
            .dir_id(id("d1"), LockMode::Read)
            .parent_name(id("d1"), "a")
            .hash_dir(3, 4)
            .acquire(&store)
            .unwrap();

        let order: Vec<String> = held
            .iter()
            .map(|lock| match lock {
                HeldLock::HashDir(guard) => format!("hash:{:?}", guard.key()),
                HeldLock::DirId(guard) => format!("dir:{}", guard.key()),
                HeldLock::ParentName(guard) => format!("name:{}", guard.key().name),
                HeldLock::FileId(guard) => format!("file:{}", guard.key()),
            })
            .collect();
        assert_eq!(
            order,
            vec![
                "hash:HashDirKey(3/4)",
                "dir:d1",
                "name:a",
                "name:b",
                "file:f1",
                "file:f2",
            ]
        );
    }

    #[test]
    fn duplicate_ids_merge_to_strongest_mode() {
        let store = EntryLockStore::default();
        let held = LockPlan::new()
            .file_id(id("x"), LockMode::Read)
            .dir_id(id("x"), LockMode::Read)
            .file_id(id("x"), LockMode::Write)
            .acquire(&store)
            .unwrap();
        assert_eq!(held.len(), 1);
        assert!(store.try_lock_file_id(&id("x"), LockMode::Read).is_none());
        drop(held);
        assert!(store.try_lock_file_id(&id("x"), LockMode::Write).is_some());
    }

    #[test]
    fn empty_keys_rejected() {
        let store = EntryLockStore::default();
        let err = LockPlan::new()
            .parent_name(id("p"), "")
            .acquire(&store)
            .unwrap_err();
        assert_eq!(err, LockPlanError::EmptyName { parent: id("p") });
        let err = LockPlan::new()
            .file_id(id(""), LockMode::Read)
            .acquire(&store)
            .unwrap_err();
        assert_eq!(err, LockPlanError::EmptyEntryId);
    }

    #[test]
    fn opposite_request_order_does_not_deadlock() {
        let store = Arc::new(EntryLockStore::default());
        let done = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..4)
            .map(|n| {
                let store = Arc::clone(&store);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let plan = if n % 2 == 0 {
                            LockPlan::new()
                                .file_id(id("a"), LockMode::Write)
                                .file_id(id("b"), LockMode::Write)
                        } else {
                            LockPlan::new()
                                .file_id(id("b"), LockMode::Write)
                                .file_id(id("a"), LockMode::Write)
                        };
                        let _held = plan.acquire(&store).expect("plan");
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("join");
        }
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(store.file_id_stats().total_refs, 0);
    }
}
