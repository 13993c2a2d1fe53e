//! Target consistency and reachability classification.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Consistency of a target relative to its buddy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyState {
    Good,
    NeedsResync,
    Bad,
}

impl ConsistencyState {
    pub const fn code(self) -> u8 {
        match self {
            ConsistencyState::Good => 0,
            ConsistencyState::NeedsResync => 1,
            ConsistencyState::Bad => 2,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ConsistencyState::Good),
            1 => Some(ConsistencyState::NeedsResync),
            2 => Some(ConsistencyState::Bad),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ConsistencyState::Good => "good",
            ConsistencyState::NeedsResync => "needs-resync",
            ConsistencyState::Bad => "bad",
        }
    }
}

impl fmt::Display for ConsistencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness of a target as seen by the local node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReachabilityState {
    Online,
    ProbablyOffline,
    Offline,
}

impl ReachabilityState {
    pub const fn code(self) -> u8 {
        match self {
            ReachabilityState::Online => 0,
            ReachabilityState::ProbablyOffline => 1,
            ReachabilityState::Offline => 2,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ReachabilityState::Online),
            1 => Some(ReachabilityState::ProbablyOffline),
            2 => Some(ReachabilityState::Offline),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ReachabilityState::Online => "online",
            ReachabilityState::ProbablyOffline => "probably-offline",
            ReachabilityState::Offline => "offline",
        }
    }
}

impl fmt::Display for ReachabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedTargetState {
    pub reachability: ReachabilityState,
    pub consistency: ConsistencyState,
}

impl CombinedTargetState {
    pub const fn new(reachability: ReachabilityState, consistency: ConsistencyState) -> Self {
        Self {
            reachability,
            consistency,
        }
    }

    /// Online and good: the only state in which a buddy may receive
    /// forwarded operations.
    pub const fn is_viable_buddy(&self) -> bool {
        matches!(self.reachability, ReachabilityState::Online)
            && matches!(self.consistency, ConsistencyState::Good)
    }
}

impl Default for CombinedTargetState {
    fn default() -> Self {
        Self::new(ReachabilityState::ProbablyOffline, ConsistencyState::Good)
    }
}
