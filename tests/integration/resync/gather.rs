//! Two gather slaves sharing one work queue.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use buddymirror::consistency::now_secs;
use buddymirror::core::TargetId;
use buddymirror::resync::{
    CandidateKind, GatherSlave, GatherSlaveConfig, GatherStatsSnapshot, GatherWorkQueue,
    SyncCandidateStore, Watermark,
};
use buddymirror::test_harness::ChunkTree;

const SUBTREES: usize = 10;

#[test]
fn shared_queue_yields_every_entry_newer_than_the_watermark() {
    let dir = tempfile::tempdir().unwrap();
    let tree = ChunkTree::new(dir.path());
    for i in 0..SUBTREES {
        tree.file(format!("s{i}/chunk"), b"c")
            .file(format!("s{i}/inner/chunk"), b"c");
    }
    // Even subtrees look untouched since long before the watermark. File
    // ctimes cannot be backdated, so all chunks stay candidates.
    for i in (0..SUBTREES).step_by(2) {
        tree.age(format!("s{i}/inner"), Duration::from_secs(3600))
            .age(format!("s{i}"), Duration::from_secs(3600));
    }

    let config = Arc::new(GatherSlaveConfig {
        root: dir.path().to_path_buf(),
        target_id: TargetId::new(7),
        watermark: Watermark::from_secs(now_secs() - 600),
        max_open_fds: 4,
    });
    let queue = Arc::new(GatherWorkQueue::new(4));
    let candidates = Arc::new(SyncCandidateStore::new());
    let slaves: Vec<_> = (0..2)
        .map(|i| {
            GatherSlave::spawn(
                format!("gather-it-{i}"),
                Arc::clone(&config),
                Arc::clone(&queue),
                Arc::clone(&candidates),
            )
            .unwrap()
        })
        .collect();

    // Capacity below the subtree count exercises producer backpressure.
    let abort = AtomicBool::new(false);
    for i in 0..SUBTREES {
        assert!(queue.push(PathBuf::from(format!("s{i}")), &abort));
    }
    for slave in &slaves {
        slave.self_terminate();
    }
    let mut stats = GatherStatsSnapshot::default();
    for slave in slaves {
        stats += slave.join();
    }

    assert!(queue.is_empty());
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.chunks_discovered, 2 * SUBTREES as u64);
    assert_eq!(stats.chunks_matched, 2 * SUBTREES as u64);
    assert_eq!(stats.dirs_discovered, 2 * SUBTREES as u64);
    assert_eq!(stats.dirs_matched, SUBTREES as u64);

    let mut files = BTreeSet::new();
    let mut dirs = BTreeSet::new();
    for candidate in candidates.drain() {
        assert_eq!(candidate.target_id, TargetId::new(7));
        match candidate.kind {
            CandidateKind::File => files.insert(candidate.relative_path),
            CandidateKind::Dir => dirs.insert(candidate.relative_path),
        };
    }
    let expected_files: BTreeSet<PathBuf> = (0..SUBTREES)
        .flat_map(|i| {
            [
                PathBuf::from(format!("s{i}/chunk")),
                PathBuf::from(format!("s{i}/inner/chunk")),
            ]
        })
        .collect();
    let expected_dirs: BTreeSet<PathBuf> = (1..SUBTREES)
        .step_by(2)
        .flat_map(|i| {
            [
                PathBuf::from(format!("s{i}")),
                PathBuf::from(format!("s{i}/inner")),
            ]
        })
        .collect();
    assert_eq!(files, expected_files);
    assert_eq!(dirs, expected_dirs);
}
