//! Target consistency: the state store contract and the durable buddy
//! communication record.

mod buddy_comm;
mod store;

pub use buddy_comm::{
    BuddyCommError, BuddyCommFile, FLAG_REQUIRED, FLAG_UNACKED, LAST_BUDDY_COMM_FILE,
    LAST_BUDDY_COMM_OVERRIDE_FILE, LastBuddyComm, NEEDS_RESYNC_FILE, now_secs,
};
pub use store::{ConsistencyStates, TargetStateStore};
