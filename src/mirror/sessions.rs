//! Exactly-once bookkeeping for sequenced requests.
//!
//! Each requestor owns a table of sequence slots. A slot is in progress while
//! the request runs and holds the encoded response once it completed, so a
//! retry replays the answer instead of applying the mutation twice. A request
//! that was applied locally but whose forward failed in transit keeps the
//! forward instead, so a retry re-sends it rather than executing again.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use bytes::Bytes;
use parking_lot::Mutex;

use super::proto::MirrorRequest;
use crate::core::{NodeId, OpsErr};

/// A locally applied request whose forward was not acknowledged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingForward {
    /// Result of the local apply.
    pub result: OpsErr,
    /// Encoded local response.
    pub body: Bytes,
    pub forward: MirrorRequest,
    /// Mirror-root paths the operation modified.
    pub modified: Vec<PathBuf>,
}

#[derive(Clone, Debug)]
enum Slot {
    InProgress,
    Done { result: OpsErr, body: Bytes },
    ForwardPending(PendingForward),
}

#[derive(Debug, Default)]
struct RequestorSession {
    seq_base: u64,
    slots: BTreeMap<u64, Slot>,
}

impl RequestorSession {
    /// Drops slots the requestor confirmed; pending forwards among them are
    /// returned since the secondary may never have seen them.
    fn prune(&mut self, seq_done: u64, abandoned: &mut Vec<PendingForward>) {
        let confirmed: Vec<u64> = self
            .slots
            .range(..=seq_done)
            .filter(|(_, slot)| !matches!(slot, Slot::InProgress))
            .map(|(seq, _)| *seq)
            .collect();
        for seq in confirmed {
            if let Some(Slot::ForwardPending(pending)) = self.slots.remove(&seq) {
                abandoned.push(pending);
            }
        }
    }

    fn highest_seen(&self) -> u64 {
        self.slots.keys().next_back().copied().unwrap_or(0)
    }
}

#[derive(Debug)]
pub enum SeqAcquire<'a> {
    /// First time this sequence number is seen; execute and complete.
    Fresh(SessionTicket<'a>),
    Replay { result: OpsErr, body: Bytes },
    /// Applied locally before; only the forward has to be retried.
    ForwardPending {
        ticket: SessionTicket<'a>,
        pending: PendingForward,
    },
    /// Same sequence number is still executing.
    InFlight,
    /// Sequence number zero: the requestor asks where to start counting.
    NewSeqBase(u64),
    /// The requestor already confirmed this sequence number as done.
    Stale,
}

#[derive(Debug, Default)]
struct SessionsInner {
    requestors: HashMap<NodeId, RequestorSession>,
    abandoned: Vec<PendingForward>,
}

#[derive(Debug, Default)]
pub struct MirrorSessions {
    inner: Mutex<SessionsInner>,
}

impl MirrorSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, requestor: NodeId, seq: u64, seq_done: u64) -> SeqAcquire<'_> {
        let mut inner = self.inner.lock();
        let SessionsInner {
            requestors,
            abandoned,
        } = &mut *inner;
        let session = requestors.entry(requestor).or_default();
        session.prune(seq_done, abandoned);

        if seq == 0 {
            let base = session
                .seq_base
                .max(session.highest_seen())
                .max(seq_done)
                .saturating_add(1);
            session.seq_base = base;
            return SeqAcquire::NewSeqBase(base);
        }
        if seq <= seq_done {
            return SeqAcquire::Stale;
        }

        let ticket = SessionTicket {
            sessions: self,
            requestor,
            seq,
            restore: None,
            finished: false,
        };
        match session.slots.get(&seq) {
            Some(Slot::InProgress) => SeqAcquire::InFlight,
            Some(Slot::Done { result, body }) => SeqAcquire::Replay {
                result: *result,
                body: body.clone(),
            },
            Some(Slot::ForwardPending(pending)) => {
                let pending = pending.clone();
                session.slots.insert(seq, Slot::InProgress);
                SeqAcquire::ForwardPending {
                    ticket: SessionTicket {
                        restore: Some(pending.clone()),
                        ..ticket
                    },
                    pending,
                }
            }
            None => {
                session.slots.insert(seq, Slot::InProgress);
                SeqAcquire::Fresh(ticket)
            }
        }
    }

    pub fn len(&self, requestor: NodeId) -> usize {
        self.inner
            .lock()
            .requestors
            .get(&requestor)
            .map(|session| session.slots.len())
            .unwrap_or(0)
    }

    /// Pending forwards whose requestor gave up on them.
    pub fn take_abandoned(&self) -> Vec<PendingForward> {
        std::mem::take(&mut self.inner.lock().abandoned)
    }

    fn finish(&self, requestor: NodeId, seq: u64, slot: Option<Slot>) {
        let mut inner = self.inner.lock();
        let Some(session) = inner.requestors.get_mut(&requestor) else {
            return;
        };
        match slot {
            Some(slot) => {
                session.slots.insert(seq, slot);
            }
            None => {
                session.slots.remove(&seq);
            }
        }
    }
}

/// Claim on an in-progress slot. Dropping it without [`complete`] frees the
/// slot so a retry executes again, or puts back the pending forward it was
/// acquired from.
///
/// [`complete`]: SessionTicket::complete
#[derive(Debug)]
#[must_use]
pub struct SessionTicket<'a> {
    sessions: &'a MirrorSessions,
    requestor: NodeId,
    seq: u64,
    restore: Option<PendingForward>,
    finished: bool,
}

impl SessionTicket<'_> {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn complete(mut self, result: OpsErr, body: Bytes) {
        self.finished = true;
        self.sessions
            .finish(self.requestor, self.seq, Some(Slot::Done { result, body }));
    }

    /// Keeps the local result and remembers the forward for the next retry.
    pub fn defer_forward(mut self, pending: PendingForward) {
        self.finished = true;
        self.sessions
            .finish(self.requestor, self.seq, Some(Slot::ForwardPending(pending)));
    }
}

impl Drop for SessionTicket<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let restore = self.restore.take().map(Slot::ForwardPending);
            self.sessions.finish(self.requestor, self.seq, restore);
        }
    }
}
