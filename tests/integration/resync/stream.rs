//! Raw resync sessions over a loopback TCP receiver.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use buddymirror::core::OpsErr;
use buddymirror::resync::{ResyncError, ResyncPacket, ResyncSessionParams, ResyncStreamSender};

use crate::fixtures::resync_rig::ResyncRig;

fn whole(base: &str) -> ResyncSessionParams {
    ResyncSessionParams {
        base_path: base.to_string(),
        whole_directory: true,
        sync_xattrs: false,
    }
}

#[test]
fn whole_directory_session_replaces_the_secondary_listing() {
    let rig = ResyncRig::start();
    let secondary = rig.secondary_tree();
    secondary
        .file("a/f1", b"old")
        .file("a/f2", b"gone")
        .file("a/f3", b"unsent")
        .file("b/keep", b"other dir");

    let none = BTreeMap::new();
    let mut sender = ResyncStreamSender::connect(&rig.sender_config(false), whole("a")).unwrap();
    sender.send(&ResyncPacket::directory("/a"), &none).unwrap();
    sender
        .send(&ResyncPacket::inode("/a/f1", b"new".to_vec()), &none)
        .unwrap();
    sender
        .send(&ResyncPacket::inode_tombstone("/a/f2"), &none)
        .unwrap();
    assert_eq!(sender.packets_sent(), 3);
    sender.finish().unwrap();

    assert_eq!(fs::read(secondary.path("a/f1")).unwrap(), b"new");
    assert!(!secondary.path("a/f2").exists());
    assert!(!secondary.path("a/f3").exists());
    assert_eq!(
        secondary.entries(),
        vec![
            PathBuf::from("a"),
            PathBuf::from("a/f1"),
            PathBuf::from("b"),
            PathBuf::from("b/keep"),
        ]
    );
}

#[test]
fn packet_outside_the_base_ends_the_session() {
    let rig = ResyncRig::start();
    rig.secondary_tree().file("a/f1", b"old").file("c/x", b"x");

    let none = BTreeMap::new();
    let mut sender = ResyncStreamSender::connect(&rig.sender_config(false), whole("a")).unwrap();
    let err = sender
        .send(&ResyncPacket::inode("/c/x", b"y".to_vec()), &none)
        .unwrap_err();
    assert!(matches!(err, ResyncError::Rejected(OpsErr::Inval)));

    // Nothing was applied and the untouched-entry sweep never ran.
    let secondary = rig.secondary_tree();
    assert_eq!(fs::read(secondary.path("c/x")).unwrap(), b"x");
    assert!(secondary.path("a/f1").exists());
}

#[test]
fn sessions_from_concurrent_senders_are_independent() {
    let rig = ResyncRig::start();
    let config = rig.sender_config(false);
    std::thread::scope(|scope| {
        for i in 0..4 {
            let config = &config;
            scope.spawn(move || {
                let dir = format!("d{i}");
                let mut sender = ResyncStreamSender::connect(config, whole(&dir)).unwrap();
                sender
                    .send(&ResyncPacket::directory(format!("/{dir}")), &BTreeMap::new())
                    .unwrap();
                sender
                    .send(
                        &ResyncPacket::inode(format!("/{dir}/f"), dir.clone().into_bytes()),
                        &BTreeMap::new(),
                    )
                    .unwrap();
                sender.finish().unwrap();
            });
        }
    });
    let secondary = rig.secondary_tree();
    for i in 0..4 {
        let content = fs::read(secondary.path(format!("d{i}/f"))).unwrap();
        assert_eq!(content, format!("d{i}").into_bytes());
    }
}
