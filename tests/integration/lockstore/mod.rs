//! Entry lock store under real thread contention.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use buddymirror::core::EntryId;
use buddymirror::lockstore::{EntryLockStore, LockMode, LockPlan, LockTableConfig};

const THREADS: usize = 8;
const ROUNDS: u64 = 200;

#[test]
fn write_lock_serializes_read_modify_write() {
    // Few buckets and a tiny free list force descriptor reuse.
    let store = Arc::new(EntryLockStore::new(LockTableConfig {
        num_buckets: 4,
        free_list_capacity: 1,
    }));
    let counter = Arc::new(AtomicU64::new(0));
    let id = EntryId::new("1-6A2B-1");

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let store = Arc::clone(&store);
            let counter = Arc::clone(&counter);
            let id = id.clone();
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let _guard = store.lock_file_id(&id, LockMode::Write);
                    let seen = counter.load(Ordering::Relaxed);
                    thread::yield_now();
                    counter.store(seen + 1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker");
    }

    assert_eq!(counter.load(Ordering::Relaxed), THREADS as u64 * ROUNDS);
    let stats = store.file_id_stats();
    assert_eq!(stats.total_refs, 0);
    assert_eq!(stats.live, 0);
}

#[test]
fn plans_declared_in_opposite_orders_do_not_deadlock() {
    let store = Arc::new(EntryLockStore::default());
    let dir = EntryId::new("dir-1");
    let file = EntryId::new("file-1");

    let forward = {
        let store = Arc::clone(&store);
        let (dir, file) = (dir.clone(), file.clone());
        thread::spawn(move || {
            for round in 0..ROUNDS {
                let _held = LockPlan::new()
                    .dir_id(dir.clone(), LockMode::Write)
                    .parent_name(dir.clone(), format!("n{}", round % 3))
                    .file_id(file.clone(), LockMode::Write)
                    .acquire(&store)
                    .expect("acquire");
            }
        })
    };
    let backward = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for round in 0..ROUNDS {
                let _held = LockPlan::new()
                    .file_id(file.clone(), LockMode::Write)
                    .parent_name(dir.clone(), format!("n{}", round % 3))
                    .dir_id(dir.clone(), LockMode::Write)
                    .acquire(&store)
                    .expect("acquire");
            }
        })
    };
    forward.join().expect("forward");
    backward.join().expect("backward");

    assert_eq!(store.file_id_stats().total_refs, 0);
    assert_eq!(store.parent_name_stats().total_refs, 0);
}

#[test]
fn readers_proceed_together_while_hash_dirs_stay_exclusive() {
    let store = Arc::new(EntryLockStore::default());
    let id = EntryId::new("shared");
    let reader = store.lock_file_id(&id, LockMode::Read);

    let other = {
        let store = Arc::clone(&store);
        let id = id.clone();
        thread::spawn(move || store.try_lock_file_id(&id, LockMode::Read).is_some())
    };
    assert!(other.join().expect("reader"));
    drop(reader);

    let held = store.lock_hash_dir(0x1F, 0x2A);
    let contender = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let _dir = store.lock_hash_dir(0x1F, 0x2A);
        })
    };
    thread::sleep(std::time::Duration::from_millis(20));
    assert!(!contender.is_finished());
    drop(held);
    contender.join().expect("contender");
    assert_eq!(store.hash_dir_stats().total_refs, 0);
}
