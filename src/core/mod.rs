//! Shared domain types: identifiers, target states, buddy groups and the
//! protocol result taxonomy.

pub mod buddy_group;
pub mod ids;
pub mod layout;
pub mod ops_err;
pub mod target_state;

pub use buddy_group::{BuddyGroupError, BuddyGroupMapper, MirrorBuddyGroup};
pub use ids::{BuddyGroupId, EntryId, NodeId, TargetId};
pub use layout::MetaPath;
pub use ops_err::{OpsErr, ops_err_from_wire};
pub use target_state::{CombinedTargetState, ConsistencyState, ReachabilityState};
