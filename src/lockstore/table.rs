//! Generic hashed lock table.
//!
//! Each bucket owns a slab of descriptor slots addressed by index. A live
//! descriptor is reachable through the bucket's key index and carries a
//! reference count. Descriptors that drop to zero references go back to a
//! bounded free list with their payload intact; once the free list is full,
//! the payload is released and the slot index parks on the vacant list.
//!
//! Descriptor lookup happens under the bucket mutex. The payload lock (the
//! actual exclusion) is taken after the bucket mutex is released, so two keys
//! sharing a bucket only contend for the lookup itself.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{
    ArcMutexGuard, ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawMutex, RawRwLock, RwLock,
};

/// Key stored in a [`LockTable`].
pub trait LockKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    fn bucket_hash(&self) -> u32;
}

/// Shared or exclusive access for readers-writer payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    pub const fn from_write(write: bool) -> Self {
        if write { LockMode::Write } else { LockMode::Read }
    }

    pub const fn is_write(self) -> bool {
        matches!(self, LockMode::Write)
    }

    /// Combined mode when the same key is requested twice.
    pub fn strongest(self, other: LockMode) -> LockMode {
        self.max(other)
    }
}

/// The exclusion primitive behind a descriptor.
pub trait LockPayload: Default + Send + Sync + 'static {
    type Mode: Copy + fmt::Debug;
    type Held;

    fn acquire(payload: &Arc<Self>, mode: Self::Mode) -> Self::Held;
    fn try_acquire(payload: &Arc<Self>, mode: Self::Mode) -> Option<Self::Held>;
}

pub enum RwHeld {
    Read(ArcRwLockReadGuard<RawRwLock, ()>),
    Write(ArcRwLockWriteGuard<RawRwLock, ()>),
}

impl LockPayload for RwLock<()> {
    type Mode = LockMode;
    type Held = RwHeld;

    fn acquire(payload: &Arc<Self>, mode: LockMode) -> RwHeld {
        match mode {
            LockMode::Read => RwHeld::Read(payload.read_arc()),
            LockMode::Write => RwHeld::Write(payload.write_arc()),
        }
    }

    fn try_acquire(payload: &Arc<Self>, mode: LockMode) -> Option<RwHeld> {
        match mode {
            LockMode::Read => payload.try_read_arc().map(RwHeld::Read),
            LockMode::Write => payload.try_write_arc().map(RwHeld::Write),
        }
    }
}

impl LockPayload for Mutex<()> {
    type Mode = ();
    type Held = ArcMutexGuard<RawMutex, ()>;

    fn acquire(payload: &Arc<Self>, _mode: ()) -> Self::Held {
        payload.lock_arc()
    }

    fn try_acquire(payload: &Arc<Self>, _mode: ()) -> Option<Self::Held> {
        payload.try_lock_arc()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockTableConfig {
    pub num_buckets: usize,
    pub free_list_capacity: usize,
}

impl Default for LockTableConfig {
    fn default() -> Self {
        Self {
            num_buckets: 1024,
            free_list_capacity: 32,
        }
    }
}

/// Point-in-time occupancy summed over all buckets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockTableStats {
    pub live: usize,
    pub free: usize,
    pub vacant: usize,
    pub total_refs: usize,
}

struct Slot<K, P> {
    key: Option<K>,
    refs: usize,
    payload: Option<Arc<P>>,
}

struct Bucket<K, P> {
    slots: Vec<Slot<K, P>>,
    index: HashMap<K, usize>,
    free: Vec<usize>,
    vacant: Vec<usize>,
}

impl<K: LockKey, P: LockPayload> Bucket<K, P> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
            free: Vec::new(),
            vacant: Vec::new(),
        }
    }

    fn checkout(&mut self, key: &K) -> (usize, Arc<P>) {
        if let Some(&idx) = self.index.get(key) {
            let slot = &mut self.slots[idx];
            slot.refs += 1;
            let payload = slot
                .payload
                .get_or_insert_with(|| Arc::new(P::default()))
                .clone();
            return (idx, payload);
        }

        let idx = if let Some(idx) = self.free.pop() {
            idx
        } else if let Some(idx) = self.vacant.pop() {
            idx
        } else {
            self.slots.push(Slot {
                key: None,
                refs: 0,
                payload: None,
            });
            self.slots.len() - 1
        };

        let slot = &mut self.slots[idx];
        debug_assert_eq!(slot.refs, 0, "recycled descriptor still referenced");
        slot.key = Some(key.clone());
        slot.refs = 1;
        let payload = slot
            .payload
            .get_or_insert_with(|| Arc::new(P::default()))
            .clone();
        self.index.insert(key.clone(), idx);
        (idx, payload)
    }

    fn release(&mut self, idx: usize, free_list_capacity: usize) {
        let Some(slot) = self.slots.get_mut(idx) else {
            debug_assert!(false, "release of unknown descriptor slot {idx}");
            return;
        };
        debug_assert!(slot.refs > 0, "descriptor refcount underflow");
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs > 0 {
            return;
        }

        if let Some(key) = slot.key.take() {
            self.index.remove(&key);
        }
        if self.free.len() < free_list_capacity {
            self.free.push(idx);
        } else {
            slot.payload = None;
            self.vacant.push(idx);
        }
    }

    fn stats(&self) -> LockTableStats {
        LockTableStats {
            live: self.index.len(),
            free: self.free.len(),
            vacant: self.vacant.len(),
            total_refs: self.slots.iter().map(|slot| slot.refs).sum(),
        }
    }
}

/// Fixed set of buckets holding reference-counted lock descriptors.
pub struct LockTable<K, P> {
    buckets: Box<[Mutex<Bucket<K, P>>]>,
    free_list_capacity: usize,
}

impl<K: LockKey, P: LockPayload> LockTable<K, P> {
    pub fn new(config: LockTableConfig) -> Self {
        let num_buckets = config.num_buckets.max(1);
        let buckets = (0..num_buckets)
            .map(|_| Mutex::new(Bucket::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets,
            free_list_capacity: config.free_list_capacity,
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_of(&self, key: &K) -> usize {
        key.bucket_hash() as usize % self.buckets.len()
    }

    /// Take the payload lock for `key`, blocking until it is available.
    pub fn lock(&self, key: &K, mode: P::Mode) -> TableGuard<'_, K, P> {
        let (bucket, slot, payload) = self.checkout(key);
        let held = P::acquire(&payload, mode);
        TableGuard {
            table: self,
            key: key.clone(),
            bucket,
            slot,
            held: Some(held),
        }
    }

    /// Non-blocking variant; the descriptor reference is dropped again when
    /// the payload is busy.
    pub fn try_lock(&self, key: &K, mode: P::Mode) -> Option<TableGuard<'_, K, P>> {
        let (bucket, slot, payload) = self.checkout(key);
        match P::try_acquire(&payload, mode) {
            Some(held) => Some(TableGuard {
                table: self,
                key: key.clone(),
                bucket,
                slot,
                held: Some(held),
            }),
            None => {
                drop(payload);
                self.release(bucket, slot);
                None
            }
        }
    }

    pub fn stats(&self) -> LockTableStats {
        self.buckets
            .iter()
            .map(|bucket| bucket.lock().stats())
            .fold(LockTableStats::default(), |acc, stats| LockTableStats {
                live: acc.live + stats.live,
                free: acc.free + stats.free,
                vacant: acc.vacant + stats.vacant,
                total_refs: acc.total_refs + stats.total_refs,
            })
    }

    /// Reference count of the live descriptor for `key`, if any.
    pub fn refs(&self, key: &K) -> Option<usize> {
        let bucket = self.buckets[self.bucket_of(key)].lock();
        bucket.index.get(key).map(|idx| bucket.slots[*idx].refs)
    }

    fn checkout(&self, key: &K) -> (usize, usize, Arc<P>) {
        let bucket = self.bucket_of(key);
        let (slot, payload) = self.buckets[bucket].lock().checkout(key);
        (bucket, slot, payload)
    }

    fn release(&self, bucket: usize, slot: usize) {
        self.buckets[bucket]
            .lock()
            .release(slot, self.free_list_capacity);
    }
}

/// Scoped lock on one table key.
///
/// Dropping the guard releases the payload first and then returns the
/// descriptor reference under the bucket mutex.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct TableGuard<'a, K: LockKey, P: LockPayload> {
    table: &'a LockTable<K, P>,
    key: K,
    bucket: usize,
    slot: usize,
    held: Option<P::Held>,
}

impl<K: LockKey, P: LockPayload> TableGuard<'_, K, P> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: LockKey, P: LockPayload> fmt::Debug for TableGuard<'_, K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableGuard")
            .field("key", &self.key)
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl<K: LockKey, P: LockPayload> Drop for TableGuard<'_, K, P> {
    fn drop(&mut self) {
        drop(self.held.take());
        self.table.release(self.bucket, self.slot);
    }
}
