//! Protocol-level operation results.
//!
//! `OpsErr` is what travels in mirror responses and resync acknowledgements.
//! Codes are stable on the wire; never renumber.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpsErr {
    Success,
    Internal,
    Inval,
    PathNotExists,
    Exists,
    /// Transport-level failure, potentially transient.
    Communication,
    UnknownNode,
    UnknownTarget,
    /// Target is not GOOD where it must be.
    Consistency,
    NotSupported,
    /// Same request is already being processed; retry later.
    Again,
    Interrupted,
}

impl OpsErr {
    pub const fn code(self) -> u32 {
        match self {
            OpsErr::Success => 0,
            OpsErr::Internal => 1,
            OpsErr::Inval => 2,
            OpsErr::PathNotExists => 4,
            OpsErr::Exists => 7,
            OpsErr::Communication => 8,
            OpsErr::UnknownNode => 11,
            OpsErr::UnknownTarget => 15,
            OpsErr::Consistency => 21,
            OpsErr::NotSupported => 23,
            OpsErr::Again => 24,
            OpsErr::Interrupted => 25,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => OpsErr::Success,
            1 => OpsErr::Internal,
            2 => OpsErr::Inval,
            4 => OpsErr::PathNotExists,
            7 => OpsErr::Exists,
            8 => OpsErr::Communication,
            11 => OpsErr::UnknownNode,
            15 => OpsErr::UnknownTarget,
            21 => OpsErr::Consistency,
            23 => OpsErr::NotSupported,
            24 => OpsErr::Again,
            25 => OpsErr::Interrupted,
            _ => return None,
        })
    }

    pub const fn is_success(self) -> bool {
        matches!(self, OpsErr::Success)
    }

    /// Routing failures that usually mean "the peer does not know this
    /// state yet", e.g. right after a restart.
    pub const fn is_routing(self) -> bool {
        matches!(self, OpsErr::UnknownTarget | OpsErr::UnknownNode)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            OpsErr::Success => "success",
            OpsErr::Internal => "internal error",
            OpsErr::Inval => "invalid argument",
            OpsErr::PathNotExists => "path does not exist",
            OpsErr::Exists => "entry exists",
            OpsErr::Communication => "communication error",
            OpsErr::UnknownNode => "unknown node",
            OpsErr::UnknownTarget => "unknown target",
            OpsErr::Consistency => "target consistency error",
            OpsErr::NotSupported => "not supported",
            OpsErr::Again => "try again",
            OpsErr::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for OpsErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for OpsErr {}

/// Unknown wire codes decode to `Internal` rather than failing the frame:
/// the peer did answer, we just cannot classify it.
pub fn ops_err_from_wire(code: u32) -> OpsErr {
    OpsErr::from_code(code).unwrap_or(OpsErr::Internal)
}
