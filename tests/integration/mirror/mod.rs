//! Primary/secondary forwarding through two in-process executors.

use buddymirror::consistency::ConsistencyStates;
use buddymirror::core::{ConsistencyState, EntryId, OpsErr, ReachabilityState};
use buddymirror::mirror::{
    CloseFile, ForwardVerdict, MetaStore, MirrorOutcome, MkFile, RequestMeta, ResyncReason,
    SkipReason, UnlinkFile,
};

use crate::fixtures::mirror_pair::{CLIENT, MirrorPair, SECONDARY};

fn mk(name: &str) -> MkFile {
    MkFile {
        parent: EntryId::new("root"),
        name: name.to_string(),
        entry_id: EntryId::new(format!("id-{name}")),
        mirrored: true,
    }
}

fn verdict<R: std::fmt::Debug>(outcome: MirrorOutcome<R>) -> (R, ForwardVerdict) {
    match outcome {
        MirrorOutcome::Executed { response, verdict } => (response, verdict),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn mirrored_operations_reach_the_secondary() {
    let pair = MirrorPair::new();

    let (response, forwarded) =
        verdict(pair.primary.process(&mut mk("a"), &RequestMeta::new(CLIENT)));
    assert_eq!(response.result, OpsErr::Success);
    assert_eq!(forwarded, ForwardVerdict::Acked);

    let mut unlink = UnlinkFile {
        parent: EntryId::new("root"),
        name: "a".to_string(),
        mirrored: true,
    };
    let _ = pair.primary.process(&mut mk("b"), &RequestMeta::new(CLIENT));
    let (_, forwarded) = verdict(pair.primary.process(&mut unlink, &RequestMeta::new(CLIENT)));
    assert_eq!(forwarded, ForwardVerdict::Acked);

    assert_eq!(pair.primary_meta.dentries(), pair.secondary_meta.dentries());
    assert_eq!(pair.secondary_meta.dentries().len(), 1);
    assert!(pair.primary_comm.last_buddy_comm().unwrap().at > 0);
    assert_eq!(pair.messenger.sent().len(), 3);
    assert!(pair.messenger.sent().iter().all(|(_, req)| req.is_secondary()));
}

#[test]
fn unknown_target_reply_is_local_success_and_flags_secondary() {
    let pair = MirrorPair::new();
    pair.secondary_replies(OpsErr::UnknownTarget);

    let (response, forwarded) =
        verdict(pair.primary.process(&mut mk("a"), &RequestMeta::new(CLIENT)));

    assert_eq!(response.result, OpsErr::Success);
    assert_eq!(
        forwarded,
        ForwardVerdict::SuccessNeedsResync(ResyncReason::SecondaryRejected(OpsErr::UnknownTarget))
    );
    assert_eq!(
        pair.states.consistency_state(SECONDARY),
        Some(ConsistencyState::NeedsResync)
    );
    assert!(pair.primary_comm.needs_resync().unwrap());
    assert_eq!(
        pair.primary_meta.lookup(&EntryId::new("root"), "a").unwrap(),
        Some(EntryId::new("id-a"))
    );
}

#[test]
fn ambiguous_transport_failure_fails_closed() {
    let pair = MirrorPair::new();
    pair.messenger.set_failing(true);

    let (response, forwarded) =
        verdict(pair.primary.process(&mut mk("a"), &RequestMeta::new(CLIENT)));
    assert_eq!(response.result, OpsErr::Communication);
    assert_eq!(forwarded, ForwardVerdict::CommunicationFailed);
    assert_eq!(
        pair.states.consistency_state(SECONDARY),
        Some(ConsistencyState::Good)
    );
    assert!(!pair.primary_comm.needs_resync().unwrap());
}

#[test]
fn offline_secondary_fails_open_until_resynced() {
    let pair = MirrorPair::new();
    pair.states
        .set_reachability(SECONDARY, ReachabilityState::Offline);

    let (response, forwarded) =
        verdict(pair.primary.process(&mut mk("a"), &RequestMeta::new(CLIENT)));
    assert_eq!(response.result, OpsErr::Success);
    assert_eq!(
        forwarded,
        ForwardVerdict::SuccessNeedsResync(ResyncReason::SecondaryOffline)
    );
    assert!(pair.messenger.sent().is_empty());

    // Back online but still flagged: nothing is forwarded until a resync
    // clears the flag.
    pair.states
        .set_reachability(SECONDARY, ReachabilityState::Online);
    let mut close = CloseFile {
        entry_id: EntryId::new("id-a"),
        mirrored: true,
    };
    let (_, forwarded) = verdict(pair.primary.process(&mut close, &RequestMeta::new(CLIENT)));
    assert_eq!(
        forwarded,
        ForwardVerdict::NotForwarded(SkipReason::BuddyNotGood(ConsistencyState::NeedsResync))
    );
    assert!(pair.secondary_meta.dentries().is_empty());
}

#[test]
fn sequenced_retry_after_a_lost_forward_reaches_the_secondary() {
    let pair = MirrorPair::new();
    let meta = RequestMeta::new(CLIENT).with_seq(1, 0);
    pair.messenger.set_failing(true);

    let (response, forwarded) = verdict(pair.primary.process(&mut mk("a"), &meta));
    assert_eq!(response.result, OpsErr::Communication);
    assert_eq!(forwarded, ForwardVerdict::CommunicationFailed);
    assert_eq!(pair.primary_meta.dentries().len(), 1);
    assert!(pair.secondary_meta.dentries().is_empty());

    pair.messenger.set_failing(false);
    let retried = pair.primary.process(&mut mk("a"), &meta);
    assert_eq!(retried.result(), OpsErr::Success);
    assert!(matches!(
        retried,
        MirrorOutcome::Reforwarded {
            verdict: ForwardVerdict::Acked,
            ..
        }
    ));
    assert_eq!(pair.primary_meta.dentries(), pair.secondary_meta.dentries());
    assert_eq!(
        pair.states.consistency_state(SECONDARY),
        Some(ConsistencyState::Good)
    );
    assert!(!pair.primary_comm.needs_resync().unwrap());

    // Once acknowledged the request replays like any completed one.
    let replayed = pair.primary.process(&mut mk("a"), &meta);
    assert!(matches!(
        replayed,
        MirrorOutcome::Replayed {
            result: OpsErr::Success,
            ..
        }
    ));
    assert_eq!(pair.messenger.sent().len(), 2);
}

#[test]
fn diverged_secondary_persists_the_resync_flag() {
    let pair = MirrorPair::new();
    pair.states.set_consistency(SECONDARY, ConsistencyState::NeedsResync);
    assert!(!pair.primary_comm.needs_resync().unwrap());

    let (response, forwarded) =
        verdict(pair.primary.process(&mut mk("a"), &RequestMeta::new(CLIENT)));
    assert_eq!(response.result, OpsErr::Success);
    assert_eq!(
        forwarded,
        ForwardVerdict::NotForwarded(SkipReason::BuddyNotGood(ConsistencyState::NeedsResync))
    );
    assert!(pair.primary_comm.needs_resync().unwrap());
}
