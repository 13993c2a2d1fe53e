#![forbid(unsafe_code)]

//! Buddy mirroring for a pair of metadata targets: the entry lock store,
//! the mirrored request executor and the resync machinery that brings a
//! stale secondary back in line with its primary.

pub mod config;
pub mod consistency;
pub mod core;
pub mod error;
pub mod lockstore;
pub mod mirror;
pub mod resync;
pub mod telemetry;
pub mod transport;

#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::core::{
    BuddyGroupId, BuddyGroupMapper, CombinedTargetState, ConsistencyState, EntryId,
    MirrorBuddyGroup, NodeId, OpsErr, ReachabilityState, TargetId,
};
pub use crate::lockstore::{EntryLockStore, LockMode, LockPlan};
