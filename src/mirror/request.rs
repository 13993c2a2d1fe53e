//! Contracts a mirrored operation implements.

use std::path::PathBuf;

use bytes::Bytes;

use super::ops::MetaStore;
use super::proto::{BUDDY_MIRROR_SECOND, MirrorOp, MirrorResponse};
use crate::core::{NodeId, OpsErr};
use crate::lockstore::{EntryLockStore, HeldLocks, LockPlanError};
use crate::transport::PacketEncodeError;

/// Envelope fields of an incoming request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestMeta {
    pub requestor: NodeId,
    /// `None` for unsequenced requests, which are never deduplicated.
    pub seq: Option<u64>,
    pub seq_done: u64,
    pub flags: u32,
}

impl RequestMeta {
    pub fn new(requestor: NodeId) -> Self {
        Self {
            requestor,
            seq: None,
            seq_done: 0,
            flags: 0,
        }
    }

    pub fn with_seq(mut self, seq: u64, seq_done: u64) -> Self {
        self.seq = Some(seq);
        self.seq_done = seq_done;
        self
    }

    pub fn as_secondary(mut self) -> Self {
        self.flags |= BUDDY_MIRROR_SECOND;
        self
    }

    pub fn is_secondary(&self) -> bool {
        self.flags & BUDDY_MIRROR_SECOND != 0
    }
}

/// Result of the local apply.
pub trait ResponseState {
    fn result(&self) -> OpsErr;

    fn set_result(&mut self, result: OpsErr);

    /// Only responses that changed something are worth forwarding.
    fn changes_observable_state(&self) -> bool {
        self.result().is_success()
    }

    /// Encoded form returned to the caller and cached for replays.
    fn encode(&self) -> Result<Bytes, PacketEncodeError>;
}

/// Collaborators available while applying locally.
pub struct ExecContext<'a> {
    pub meta: &'a dyn MetaStore,
    pub locks: &'a EntryLockStore,
    pub requestor: NodeId,
}

/// A mutating operation that may have to be mirrored to a secondary.
pub trait MirroredRequest {
    type Response: ResponseState;

    /// Whether the entry this operation touches belongs to a mirror group.
    fn is_mirrored(&self) -> bool;

    fn lock<'a>(&self, locks: &'a EntryLockStore) -> Result<HeldLocks<'a>, LockPlanError>;

    fn execute_locally(&mut self, ctx: &mut ExecContext<'_>, is_secondary: bool)
    -> Self::Response;

    /// The operation the secondary has to apply, given the local result.
    fn forward_request(&self, response: &Self::Response) -> MirrorOp;

    /// Mirror-root paths the local apply changed, see [`crate::core::layout`].
    fn modified_paths(&self, response: &Self::Response) -> Vec<PathBuf>;

    fn process_secondary_response(&self, response: &MirrorResponse) -> OpsErr {
        response.result
    }

    /// Response used when the operation is refused before it executes.
    fn error_response(&self, result: OpsErr) -> Self::Response;

    fn log_context(&self) -> &'static str;
}
