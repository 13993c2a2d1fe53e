//! Mirrored request executor.
//!
//! Every mutating operation runs through [`MirrorExecutor::process`]:
//!
//! ```text
//! primary:   received -> locked -> applied -> forwarded -> (acked | failed) -> responded
//! secondary: received -> locked -> applied -> responded
//! ```
//!
//! The executor classifies the forward outcome. A secondary that is known to
//! be offline or that does not know the target yet is flagged for resync and
//! the client sees success. Any ambiguous transport failure is reported as
//! `Communication` and leaves the target state untouched; a sequenced retry
//! then re-sends the stored forward instead of applying the operation again.
//! While a resync runs, modified paths go to the resync job instead of the
//! secondary.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use super::messenger::{Messenger, TargetRoutes};
use super::ops::MetaStore;
use super::proto::{BUDDY_MIRROR_SECOND, MirrorRequest};
use super::request::{ExecContext, MirroredRequest, RequestMeta, ResponseState};
use super::sessions::{MirrorSessions, PendingForward, SeqAcquire, SessionTicket};
use crate::consistency::{BuddyCommFile, ConsistencyStates};
use crate::core::{BuddyGroupMapper, ConsistencyState, OpsErr, ReachabilityState, TargetId};
use crate::lockstore::EntryLockStore;
use crate::resync::{ModificationGuard, ModificationLog};

/// Why a locally applied operation was not forwarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NotMirrored,
    /// The request itself is a forwarded copy.
    Secondary,
    NoLocalGroup,
    NotPrimary,
    NoStateChange,
    /// The running resync picks the modification up.
    ResyncInProgress,
    /// Secondary already diverged; it stays flagged until resynced.
    BuddyNotGood(ConsistencyState),
}

/// Why a forward counted as success but left the secondary flagged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResyncReason {
    SecondaryOffline,
    UnknownSecondaryState,
    NoRoute,
    /// The secondary answered with a routing error.
    SecondaryRejected(OpsErr),
    /// A resync is marked running but no job takes modifications.
    UntrackedResync,
    /// The requestor confirmed a request whose forward never got through.
    ForwardAbandoned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardVerdict {
    NotForwarded(SkipReason),
    Acked,
    SuccessNeedsResync(ResyncReason),
    CommunicationFailed,
    SecondaryError(OpsErr),
}

impl ForwardVerdict {
    /// Result the client sees, given the local result.
    pub fn client_result(self, local: OpsErr) -> OpsErr {
        match self {
            ForwardVerdict::CommunicationFailed => OpsErr::Communication,
            ForwardVerdict::SecondaryError(err) => err,
            _ => local,
        }
    }
}

#[derive(Debug)]
pub enum MirrorOutcome<R> {
    Executed {
        response: R,
        verdict: ForwardVerdict,
    },
    /// A completed request was retried; the cached answer is returned.
    Replayed { result: OpsErr, body: Bytes },
    /// A retry of a request whose earlier forward failed in transit. Only
    /// the forward ran again.
    Reforwarded {
        result: OpsErr,
        body: Bytes,
        verdict: ForwardVerdict,
    },
    /// The same sequence number is still executing.
    Again,
    NewSeqBase(u64),
    /// Refused before execution.
    Rejected(OpsErr),
}

impl<R: ResponseState> MirrorOutcome<R> {
    pub fn result(&self) -> OpsErr {
        match self {
            MirrorOutcome::Executed { response, .. } => response.result(),
            MirrorOutcome::Replayed { result, .. } | MirrorOutcome::Reforwarded { result, .. } => {
                *result
            }
            MirrorOutcome::Again => OpsErr::Again,
            MirrorOutcome::NewSeqBase(_) => OpsErr::Success,
            MirrorOutcome::Rejected(err) => *err,
        }
    }

    /// Encoded response body, empty when there is none.
    pub fn body(&self) -> Bytes {
        match self {
            MirrorOutcome::Executed { response, .. } => encode_or_empty(response),
            MirrorOutcome::Replayed { body, .. } | MirrorOutcome::Reforwarded { body, .. } => {
                body.clone()
            }
            MirrorOutcome::NewSeqBase(base) => Bytes::copy_from_slice(&base.to_le_bytes()),
            MirrorOutcome::Again | MirrorOutcome::Rejected(_) => Bytes::new(),
        }
    }
}

pub struct MirrorExecutorConfig {
    /// The target this node serves in its buddy group.
    pub local_target: TargetId,
    pub groups: Arc<BuddyGroupMapper>,
    pub states: Arc<dyn ConsistencyStates>,
    pub buddy_comm: Arc<BuddyCommFile>,
    pub locks: Arc<EntryLockStore>,
    pub messenger: Arc<dyn Messenger>,
    pub meta: Arc<dyn MetaStore>,
    pub routes: Arc<TargetRoutes>,
    /// Shared with the resync jobs of `local_target`.
    pub modifications: Arc<ModificationLog>,
}

pub struct MirrorExecutor {
    local_target: TargetId,
    groups: Arc<BuddyGroupMapper>,
    states: Arc<dyn ConsistencyStates>,
    buddy_comm: Arc<BuddyCommFile>,
    locks: Arc<EntryLockStore>,
    messenger: Arc<dyn Messenger>,
    meta: Arc<dyn MetaStore>,
    routes: Arc<TargetRoutes>,
    modifications: Arc<ModificationLog>,
    sessions: MirrorSessions,
}

impl fmt::Debug for MirrorExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorExecutor")
            .field("local_target", &self.local_target)
            .finish_non_exhaustive()
    }
}

/// At most one forwarded copy per operation.
#[derive(Default)]
struct ForwardSlot {
    sent: Option<MirrorRequest>,
}

impl ForwardSlot {
    fn claim(&mut self, forwarded: MirrorRequest) -> &MirrorRequest {
        debug_assert!(self.sent.is_none(), "second forward started for one operation");
        self.sent.insert(forwarded)
    }
}

impl MirrorExecutor {
    pub fn new(config: MirrorExecutorConfig) -> Self {
        Self {
            local_target: config.local_target,
            groups: config.groups,
            states: config.states,
            buddy_comm: config.buddy_comm,
            locks: config.locks,
            messenger: config.messenger,
            meta: config.meta,
            routes: config.routes,
            modifications: config.modifications,
            sessions: MirrorSessions::new(),
        }
    }

    pub fn local_target(&self) -> TargetId {
        self.local_target
    }

    pub fn locks(&self) -> &EntryLockStore {
        &self.locks
    }

    pub fn sessions(&self) -> &MirrorSessions {
        &self.sessions
    }

    pub fn modifications(&self) -> &Arc<ModificationLog> {
        &self.modifications
    }

    pub fn process<R: MirroredRequest>(
        &self,
        request: &mut R,
        meta: &RequestMeta,
    ) -> MirrorOutcome<R::Response> {
        let op = request.log_context();
        let is_secondary = meta.is_secondary();
        // Entered before any entry lock is taken; a finishing resync waits
        // for requests in flight here.
        let modifications = self.modifications.enter();

        let ticket = match meta.seq {
            None => None,
            Some(seq) => {
                let acquired = self.sessions.acquire(meta.requestor, seq, meta.seq_done);
                self.settle_abandoned(&modifications);
                match acquired {
                    SeqAcquire::Fresh(ticket) => Some(ticket),
                    SeqAcquire::ForwardPending { ticket, pending } => {
                        return self.retry_forward(request, ticket, pending, &modifications);
                    }
                    SeqAcquire::Replay { result, body } => {
                        tracing::debug!(op, seq, %result, "replaying completed request");
                        return MirrorOutcome::Replayed { result, body };
                    }
                    SeqAcquire::InFlight => return MirrorOutcome::Again,
                    SeqAcquire::NewSeqBase(base) => return MirrorOutcome::NewSeqBase(base),
                    SeqAcquire::Stale => {
                        tracing::warn!(op, seq, seq_done = meta.seq_done, "stale sequence number");
                        return MirrorOutcome::Rejected(OpsErr::Inval);
                    }
                }
            }
        };

        let locks = match request.lock(&self.locks) {
            Ok(locks) => locks,
            Err(err) => {
                tracing::warn!(op, "lock acquisition refused: {err}");
                return MirrorOutcome::Rejected(OpsErr::Inval);
            }
        };

        let mut ctx = ExecContext {
            meta: self.meta.as_ref(),
            locks: &self.locks,
            requestor: meta.requestor,
        };
        let mut response = request.execute_locally(&mut ctx, is_secondary);
        let local_result = response.result();

        let mut slot = ForwardSlot::default();
        let verdict = self.forward_if_needed(request, &response, meta, &modifications, &mut slot);
        let pending = match (&ticket, slot.sent.take()) {
            (Some(_), Some(forward)) if verdict == ForwardVerdict::CommunicationFailed => {
                Some(PendingForward {
                    result: local_result,
                    body: encode_or_empty(&response),
                    forward,
                    modified: request.modified_paths(&response),
                })
            }
            _ => None,
        };
        let result = verdict.client_result(local_result);
        if result != local_result {
            response.set_result(result);
        }
        tracing::debug!(op, is_secondary, %result, ?verdict, "request processed");

        if let Some(ticket) = ticket {
            match pending {
                Some(pending) => ticket.defer_forward(pending),
                None => ticket.complete(result, encode_or_empty(&response)),
            }
        }
        drop(locks);

        MirrorOutcome::Executed { response, verdict }
    }

    /// Re-sends a forward that failed in transit. The operation is not
    /// applied again; the secondary deduplicates by sequence number.
    fn retry_forward<R: MirroredRequest>(
        &self,
        request: &R,
        ticket: SessionTicket<'_>,
        pending: PendingForward,
        modifications: &ModificationGuard<'_>,
    ) -> MirrorOutcome<R::Response> {
        let op = request.log_context();
        let locks = match request.lock(&self.locks) {
            Ok(locks) => locks,
            Err(err) => {
                tracing::warn!(op, "lock acquisition refused: {err}");
                return MirrorOutcome::Rejected(OpsErr::Inval);
            }
        };

        let mut slot = ForwardSlot::default();
        let verdict = match self.local_secondary() {
            Some(secondary) => self.forward_to(
                request,
                secondary,
                pending.forward.clone(),
                &pending.modified,
                modifications,
                &mut slot,
            ),
            None => ForwardVerdict::NotForwarded(SkipReason::NotPrimary),
        };
        let result = verdict.client_result(pending.result);
        let body = if result == pending.result {
            pending.body.clone()
        } else {
            encode_or_empty(&request.error_response(result))
        };
        tracing::debug!(op, seq = ticket.seq(), %result, ?verdict, "pending forward retried");

        if verdict == ForwardVerdict::CommunicationFailed {
            ticket.defer_forward(pending);
        } else {
            ticket.complete(result, body.clone());
        }
        drop(locks);

        MirrorOutcome::Reforwarded {
            result,
            body,
            verdict,
        }
    }

    /// The secondary of the local group while this target is its primary.
    fn local_secondary(&self) -> Option<TargetId> {
        let group = self.groups.local_group().and_then(|id| self.groups.group(id))?;
        (group.primary == self.local_target).then_some(group.secondary)
    }

    /// Pending forwards the requestor gave up on may be missing on the
    /// secondary.
    fn settle_abandoned(&self, modifications: &ModificationGuard<'_>) {
        let abandoned = self.sessions.take_abandoned();
        if abandoned.is_empty() {
            return;
        }
        let paths: Vec<PathBuf> = abandoned
            .iter()
            .flat_map(|pending| pending.modified.iter().cloned())
            .collect();
        if modifications.record(&paths) {
            return;
        }
        if let Some(secondary) = self.local_secondary() {
            tracing::warn!(
                target_id = %secondary,
                count = abandoned.len(),
                "requestor confirmed requests whose forward never got through"
            );
            self.flag_secondary(secondary, ResyncReason::ForwardAbandoned);
        }
    }

    fn forward_if_needed<R: MirroredRequest>(
        &self,
        request: &R,
        response: &R::Response,
        meta: &RequestMeta,
        modifications: &ModificationGuard<'_>,
        slot: &mut ForwardSlot,
    ) -> ForwardVerdict {
        if !request.is_mirrored() {
            return ForwardVerdict::NotForwarded(SkipReason::NotMirrored);
        }
        if meta.is_secondary() {
            return ForwardVerdict::NotForwarded(SkipReason::Secondary);
        }
        let Some(group) = self
            .groups
            .local_group()
            .and_then(|id| self.groups.group(id))
        else {
            return ForwardVerdict::NotForwarded(SkipReason::NoLocalGroup);
        };
        if group.primary != self.local_target {
            return ForwardVerdict::NotForwarded(SkipReason::NotPrimary);
        }
        if !response.changes_observable_state() {
            return ForwardVerdict::NotForwarded(SkipReason::NoStateChange);
        }

        let forwarded = MirrorRequest {
            requestor: meta.requestor,
            seq: meta.seq,
            seq_done: meta.seq_done,
            flags: meta.flags | BUDDY_MIRROR_SECOND,
            op: request.forward_request(response),
        };
        self.forward_to(
            request,
            group.secondary,
            forwarded,
            &request.modified_paths(response),
            modifications,
            slot,
        )
    }

    fn forward_to<R: MirroredRequest>(
        &self,
        request: &R,
        secondary: TargetId,
        forwarded: MirrorRequest,
        modified: &[PathBuf],
        modifications: &ModificationGuard<'_>,
        slot: &mut ForwardSlot,
    ) -> ForwardVerdict {
        if modifications.record(modified) {
            return ForwardVerdict::NotForwarded(SkipReason::ResyncInProgress);
        }
        if self.states.is_resync_in_progress(self.local_target) {
            return self.flag_secondary(secondary, ResyncReason::UntrackedResync);
        }

        match self.states.consistency_state(secondary) {
            Some(ConsistencyState::Good) => {}
            Some(state) => {
                if let Err(err) = self.buddy_comm.set_needs_resync(true) {
                    tracing::error!(target_id = %secondary, "failed to persist resync flag: {err}");
                }
                return ForwardVerdict::NotForwarded(SkipReason::BuddyNotGood(state));
            }
            None => return self.flag_secondary(secondary, ResyncReason::UnknownSecondaryState),
        }
        if self.states.reachability_state(secondary) == Some(ReachabilityState::Offline) {
            return self.flag_secondary(secondary, ResyncReason::SecondaryOffline);
        }
        let Some(node) = self.routes.node_of(secondary) else {
            return self.flag_secondary(secondary, ResyncReason::NoRoute);
        };

        let forwarded = slot.claim(forwarded);
        let Some(reply) = self.messenger.request_response(node, forwarded) else {
            if self.states.reachability_state(secondary) == Some(ReachabilityState::Offline) {
                return self.flag_secondary(secondary, ResyncReason::SecondaryOffline);
            }
            tracing::warn!(
                op = request.log_context(),
                target_id = %secondary,
                node_id = %node,
                "forward failed and secondary is not known to be offline"
            );
            return ForwardVerdict::CommunicationFailed;
        };

        let result = request.process_secondary_response(&reply);
        if result.is_success() {
            if let Err(err) = self.buddy_comm.touch() {
                tracing::warn!(target_id = %secondary, "failed to record buddy communication: {err}");
            }
            return ForwardVerdict::Acked;
        }
        if result.is_routing() {
            return self.flag_secondary(secondary, ResyncReason::SecondaryRejected(result));
        }
        tracing::warn!(
            op = request.log_context(),
            target_id = %secondary,
            %result,
            "secondary failed forwarded request"
        );
        ForwardVerdict::SecondaryError(result)
    }

    fn flag_secondary(&self, secondary: TargetId, reason: ResyncReason) -> ForwardVerdict {
        tracing::info!(target_id = %secondary, ?reason, "marking secondary as needing resync");
        self.states.set_buddy_needs_resync(secondary, true);
        if let Err(err) = self.buddy_comm.set_needs_resync(true) {
            tracing::error!(target_id = %secondary, "failed to persist resync flag: {err}");
        }
        ForwardVerdict::SuccessNeedsResync(reason)
    }
}

fn encode_or_empty<R: ResponseState>(response: &R) -> Bytes {
    match response.encode() {
        Ok(body) => body,
        Err(err) => {
            tracing::error!("failed to encode response: {err}");
            Bytes::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BuddyGroupId, CombinedTargetState, EntryId, MirrorBuddyGroup, NodeId};
    use crate::mirror::ops::{CloseFile, MkFile};
    use crate::mirror::proto::MirrorResponse;
    use crate::consistency::TargetStateStore;
    use crate::resync::SyncCandidateStore;
    use crate::test_harness::{MemMetaStore, ScriptedMessenger};

    const PRIMARY: TargetId = TargetId::new(1);
    const SECONDARY: TargetId = TargetId::new(2);
    const CLIENT: NodeId = NodeId::new(100);

    struct Fixture {
        _dir: tempfile::TempDir,
        states: Arc<TargetStateStore>,
        messenger: Arc<ScriptedMessenger>,
        meta: Arc<MemMetaStore>,
        buddy_comm: Arc<BuddyCommFile>,
        modifications: Arc<ModificationLog>,
        executor: MirrorExecutor,
    }

    fn fixture(reachability: ReachabilityState) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let groups = Arc::new(BuddyGroupMapper::new());
        let group = BuddyGroupId::new(1);
        groups
            .add_group(group, MirrorBuddyGroup::new(PRIMARY, SECONDARY))
            .unwrap();
        groups.set_local_group(Some(group));

        let states = Arc::new(TargetStateStore::new());
        states.insert(
            SECONDARY,
            CombinedTargetState::new(reachability, ConsistencyState::Good),
        );
        let routes = Arc::new(TargetRoutes::new());
        routes.set_route(SECONDARY, NodeId::new(2));

        let messenger = Arc::new(ScriptedMessenger::new());
        let meta = Arc::new(MemMetaStore::new());
        let buddy_comm = Arc::new(BuddyCommFile::new(dir.path()));
        let modifications = Arc::new(ModificationLog::new());
        let executor = MirrorExecutor::new(MirrorExecutorConfig {
            local_target: PRIMARY,
            groups,
            states: states.clone(),
            buddy_comm: Arc::clone(&buddy_comm),
            locks: Arc::new(EntryLockStore::default()),
            messenger: messenger.clone(),
            meta: meta.clone(),
            routes,
            modifications: Arc::clone(&modifications),
        });
        Fixture {
            _dir: dir,
            states,
            messenger,
            meta,
            buddy_comm,
            modifications,
            executor,
        }
    }

    fn mk(name: &str) -> MkFile {
        MkFile {
            parent: EntryId::new("root"),
            name: name.to_string(),
            entry_id: EntryId::new(format!("id-{name}")),
            mirrored: true,
        }
    }

    fn executed<R: fmt::Debug>(outcome: MirrorOutcome<R>) -> (R, ForwardVerdict) {
        match outcome {
            MirrorOutcome::Executed { response, verdict } => (response, verdict),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn acked_forward_touches_last_buddy_comm() {
        let fx = fixture(ReachabilityState::Online);
        fx.messenger.push(Some(MirrorResponse::new(OpsErr::Success)));

        let (response, verdict) =
            executed(fx.executor.process(&mut mk("a"), &RequestMeta::new(CLIENT)));
        assert_eq!(response.result, OpsErr::Success);
        assert_eq!(verdict, ForwardVerdict::Acked);
        assert!(fx.buddy_comm.last_buddy_comm().unwrap().at > 0);

        let sent = fx.messenger.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.is_secondary());
    }

    #[test]
    fn offline_transport_failure_is_success_with_resync() {
        let fx = fixture(ReachabilityState::ProbablyOffline);
        let states = Arc::clone(&fx.states);
        fx.messenger.push_with(move || {
            states.set_reachability(SECONDARY, ReachabilityState::Offline);
            None
        });

        let (response, verdict) =
            executed(fx.executor.process(&mut mk("a"), &RequestMeta::new(CLIENT)));
        assert_eq!(response.result, OpsErr::Success);
        assert_eq!(
            verdict,
            ForwardVerdict::SuccessNeedsResync(ResyncReason::SecondaryOffline)
        );
        assert_eq!(
            fx.states.consistency_state(SECONDARY),
            Some(ConsistencyState::NeedsResync)
        );
        assert!(fx.buddy_comm.needs_resync().unwrap());
    }

    #[test]
    fn online_transport_failure_is_communication_error() {
        let fx = fixture(ReachabilityState::Online);
        fx.messenger.push(None);

        let (response, verdict) =
            executed(fx.executor.process(&mut mk("a"), &RequestMeta::new(CLIENT)));
        assert_eq!(response.result, OpsErr::Communication);
        assert_eq!(verdict, ForwardVerdict::CommunicationFailed);
        assert_eq!(
            fx.states.consistency_state(SECONDARY),
            Some(ConsistencyState::Good)
        );
        assert!(!fx.buddy_comm.needs_resync().unwrap());
    }

    #[test]
    fn unknown_target_reply_flags_secondary() {
        let fx = fixture(ReachabilityState::Online);
        fx.messenger
            .push(Some(MirrorResponse::new(OpsErr::UnknownTarget)));

        let (response, verdict) =
            executed(fx.executor.process(&mut mk("a"), &RequestMeta::new(CLIENT)));
        assert_eq!(response.result, OpsErr::Success);
        assert_eq!(
            verdict,
            ForwardVerdict::SuccessNeedsResync(ResyncReason::SecondaryRejected(
                OpsErr::UnknownTarget
            ))
        );
        assert_eq!(
            fx.states.consistency_state(SECONDARY),
            Some(ConsistencyState::NeedsResync)
        );
    }

    #[test]
    fn other_secondary_errors_propagate() {
        let fx = fixture(ReachabilityState::Online);
        fx.messenger.push(Some(MirrorResponse::new(OpsErr::Exists)));

        let (response, verdict) =
            executed(fx.executor.process(&mut mk("a"), &RequestMeta::new(CLIENT)));
        assert_eq!(response.result, OpsErr::Exists);
        assert_eq!(verdict, ForwardVerdict::SecondaryError(OpsErr::Exists));
        assert_eq!(
            fx.states.consistency_state(SECONDARY),
            Some(ConsistencyState::Good)
        );
    }

    #[test]
    fn offline_secondary_is_not_contacted() {
        let fx = fixture(ReachabilityState::Offline);
        let (response, verdict) =
            executed(fx.executor.process(&mut mk("a"), &RequestMeta::new(CLIENT)));
        assert_eq!(response.result, OpsErr::Success);
        assert_eq!(
            verdict,
            ForwardVerdict::SuccessNeedsResync(ResyncReason::SecondaryOffline)
        );
        assert!(fx.messenger.sent().is_empty());
    }

    #[test]
    fn diverged_secondary_skips_forward_and_persists_the_flag() {
        let fx = fixture(ReachabilityState::Online);
        fx.states.set_consistency(SECONDARY, ConsistencyState::Bad);
        let (_, verdict) = executed(fx.executor.process(&mut mk("a"), &RequestMeta::new(CLIENT)));
        assert_eq!(
            verdict,
            ForwardVerdict::NotForwarded(SkipReason::BuddyNotGood(ConsistencyState::Bad))
        );
        assert!(fx.buddy_comm.needs_resync().unwrap());
        assert_eq!(
            fx.states.consistency_state(SECONDARY),
            Some(ConsistencyState::Bad)
        );
        assert!(fx.messenger.sent().is_empty());
    }

    #[test]
    fn running_resync_receives_the_modified_paths() {
        let fx = fixture(ReachabilityState::Online);
        let candidates = Arc::new(SyncCandidateStore::new());
        fx.modifications.attach(PRIMARY, Arc::clone(&candidates));
        fx.states.set_resync_in_progress(PRIMARY, true);

        let (response, verdict) =
            executed(fx.executor.process(&mut mk("b"), &RequestMeta::new(CLIENT)));
        assert_eq!(response.result, OpsErr::Success);
        assert_eq!(
            verdict,
            ForwardVerdict::NotForwarded(SkipReason::ResyncInProgress)
        );
        let mut queued: Vec<_> = candidates
            .drain()
            .into_iter()
            .map(|candidate| candidate.relative_path)
            .collect();
        queued.sort();
        assert_eq!(
            queued,
            vec![PathBuf::from("dentries/root/b"), PathBuf::from("inodes/id-b")]
        );
        assert!(fx.messenger.sent().is_empty());
        assert!(!fx.buddy_comm.needs_resync().unwrap());
    }

    #[test]
    fn resync_without_a_modification_sink_flags_the_secondary() {
        let fx = fixture(ReachabilityState::Online);
        fx.states.set_resync_in_progress(PRIMARY, true);
        let (_, verdict) = executed(fx.executor.process(&mut mk("b"), &RequestMeta::new(CLIENT)));
        assert_eq!(
            verdict,
            ForwardVerdict::SuccessNeedsResync(ResyncReason::UntrackedResync)
        );
        assert!(fx.buddy_comm.needs_resync().unwrap());
    }

    #[test]
    fn failed_local_apply_is_not_forwarded() {
        let fx = fixture(ReachabilityState::Online);
        let mut close = CloseFile {
            entry_id: EntryId::new("missing"),
            mirrored: true,
        };
        let (response, verdict) =
            executed(fx.executor.process(&mut close, &RequestMeta::new(CLIENT)));
        assert_eq!(response.result, OpsErr::PathNotExists);
        assert_eq!(
            verdict,
            ForwardVerdict::NotForwarded(SkipReason::NoStateChange)
        );
    }

    #[test]
    fn secondary_copy_applies_without_forwarding() {
        let fx = fixture(ReachabilityState::Online);
        let meta = RequestMeta::new(CLIENT).as_secondary();
        let (response, verdict) = executed(fx.executor.process(&mut mk("a"), &meta));
        assert_eq!(response.result, OpsErr::Success);
        assert_eq!(verdict, ForwardVerdict::NotForwarded(SkipReason::Secondary));
        assert_eq!(
            fx.meta.lookup(&EntryId::new("root"), "a").unwrap(),
            Some(EntryId::new("id-a"))
        );
    }

    #[test]
    fn sequenced_retry_replays_without_reapplying() {
        let fx = fixture(ReachabilityState::Online);
        fx.messenger.push(Some(MirrorResponse::new(OpsErr::Success)));
        let meta = RequestMeta::new(CLIENT).with_seq(1, 0);

        let (first, _) = executed(fx.executor.process(&mut mk("a"), &meta));
        assert_eq!(first.result, OpsErr::Success);

        match fx.executor.process(&mut mk("a"), &meta) {
            MirrorOutcome::Replayed { result, .. } => assert_eq!(result, OpsErr::Success),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.messenger.sent().len(), 1);
    }

    #[test]
    fn retry_after_communication_failure_resends_the_stored_forward() {
        let fx = fixture(ReachabilityState::Online);
        let meta = RequestMeta::new(CLIENT).with_seq(1, 0);
        fx.messenger.push(None);

        let (first, verdict) = executed(fx.executor.process(&mut mk("a"), &meta));
        assert_eq!(first.result, OpsErr::Communication);
        assert_eq!(verdict, ForwardVerdict::CommunicationFailed);
        assert!(fx.meta.lookup(&EntryId::new("root"), "a").unwrap().is_some());

        fx.messenger.push(Some(MirrorResponse::new(OpsErr::Success)));
        match fx.executor.process(&mut mk("a"), &meta) {
            MirrorOutcome::Reforwarded {
                result, verdict, ..
            } => {
                assert_eq!(result, OpsErr::Success);
                assert_eq!(verdict, ForwardVerdict::Acked);
            }
            other => panic!("unexpected {other:?}"),
        }
        let sent = fx.messenger.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, sent[1].1);
        assert_eq!(sent[1].1.seq, Some(1));

        match fx.executor.process(&mut mk("a"), &meta) {
            MirrorOutcome::Replayed { result, .. } => assert_eq!(result, OpsErr::Success),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.messenger.sent().len(), 2);
        assert_eq!(
            fx.states.consistency_state(SECONDARY),
            Some(ConsistencyState::Good)
        );
    }

    #[test]
    fn repeated_communication_failure_keeps_the_forward_pending() {
        let fx = fixture(ReachabilityState::Online);
        let meta = RequestMeta::new(CLIENT).with_seq(1, 0);
        fx.messenger.push(None);
        let _ = fx.executor.process(&mut mk("a"), &meta);

        fx.messenger.push(None);
        let outcome = fx.executor.process(&mut mk("a"), &meta);
        assert_eq!(outcome.result(), OpsErr::Communication);
        assert!(matches!(
            outcome,
            MirrorOutcome::Reforwarded {
                verdict: ForwardVerdict::CommunicationFailed,
                ..
            }
        ));

        // The secondary turned out to be gone: the retry succeeds and flags it.
        fx.states.set_reachability(SECONDARY, ReachabilityState::Offline);
        let outcome = fx.executor.process(&mut mk("a"), &meta);
        assert_eq!(outcome.result(), OpsErr::Success);
        assert_eq!(
            fx.states.consistency_state(SECONDARY),
            Some(ConsistencyState::NeedsResync)
        );
        assert_eq!(fx.messenger.sent().len(), 2);
    }

    #[test]
    fn confirmed_request_with_a_lost_forward_flags_the_secondary() {
        let fx = fixture(ReachabilityState::Online);
        fx.messenger.push(None);
        let _ = fx
            .executor
            .process(&mut mk("a"), &RequestMeta::new(CLIENT).with_seq(1, 0));
        assert!(!fx.buddy_comm.needs_resync().unwrap());

        let (_, verdict) = executed(
            fx.executor
                .process(&mut mk("b"), &RequestMeta::new(CLIENT).with_seq(2, 1)),
        );
        assert_eq!(
            verdict,
            ForwardVerdict::NotForwarded(SkipReason::BuddyNotGood(ConsistencyState::NeedsResync))
        );
        assert_eq!(fx.messenger.sent().len(), 1);
        assert_eq!(
            fx.states.consistency_state(SECONDARY),
            Some(ConsistencyState::NeedsResync)
        );
        assert!(fx.buddy_comm.needs_resync().unwrap());
    }

    #[test]
    fn locks_are_released_after_processing() {
        let fx = fixture(ReachabilityState::Offline);
        let _ = fx.executor.process(&mut mk("a"), &RequestMeta::new(CLIENT));
        assert_eq!(fx.executor.locks().file_id_stats().total_refs, 0);
        assert_eq!(fx.executor.locks().parent_name_stats().total_refs, 0);
    }
}
