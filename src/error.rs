use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::consistency::BuddyCommError;
use crate::core::{BuddyGroupError, OpsErr};
use crate::lockstore::LockPlanError;
use crate::mirror::{MirrorSessionError, TransportError};
use crate::resync::{ResyncError, ResyncJobError};
use crate::transport::{FrameError, ListenerError, PacketDecodeError, PacketEncodeError};

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (locally or remotely).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the subsystem errors; match on the inner error for
/// details.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    BuddyGroup(#[from] BuddyGroupError),

    #[error(transparent)]
    LockPlan(#[from] LockPlanError),

    #[error(transparent)]
    BuddyComm(#[from] BuddyCommError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Encode(#[from] PacketEncodeError),

    #[error(transparent)]
    Decode(#[from] PacketDecodeError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    MirrorSession(#[from] MirrorSessionError),

    #[error(transparent)]
    Resync(#[from] ResyncError),

    #[error(transparent)]
    ResyncJob(#[from] ResyncJobError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::BuddyGroup(BuddyGroupError::GroupReferenced(_)) => Transience::Retryable,
            Error::BuddyGroup(_)
            | Error::LockPlan(_)
            | Error::Encode(_)
            | Error::Decode(_)
            | Error::Config(_) => Transience::Permanent,
            Error::BuddyComm(BuddyCommError::Malformed { .. }) => Transience::Permanent,
            Error::BuddyComm(_) => Transience::Unknown,
            Error::Frame(e) => frame_transience(e),
            Error::Listener(ListenerError::Io(e)) => io_transience(e),
            Error::Transport(e) => match e {
                TransportError::UnknownNode(_) => Transience::Permanent,
                TransportError::Resolve { .. } | TransportError::Closed => Transience::Retryable,
                TransportError::Io(e) => io_transience(e),
                TransportError::Frame(e) => frame_transience(e),
                TransportError::Encode(_) | TransportError::Decode(_) => Transience::Permanent,
            },
            Error::MirrorSession(e) => match e {
                MirrorSessionError::Io(e) => io_transience(e),
                MirrorSessionError::Frame(e) => frame_transience(e),
                MirrorSessionError::Encode(_) => Transience::Permanent,
            },
            Error::Resync(e) => match e {
                ResyncError::Io(e) => io_transience(e),
                ResyncError::Frame(e) => frame_transience(e),
                ResyncError::UnexpectedEof => Transience::Retryable,
                ResyncError::Rejected(OpsErr::Again | OpsErr::Communication) => {
                    Transience::Retryable
                }
                ResyncError::Decode(_)
                | ResyncError::Encode(_)
                | ResyncError::UnexpectedEnd
                | ResyncError::Rejected(_)
                | ResyncError::InvalidPath(_)
                | ResyncError::Lock(_) => Transience::Permanent,
            },
            Error::ResyncJob(e) => match e {
                ResyncJobError::AlreadyRunning(_) | ResyncJobError::Spawn(_) => {
                    Transience::Retryable
                }
                ResyncJobError::MirrorRoot { .. } | ResyncJobError::NotADirectory(_) => {
                    Transience::Permanent
                }
                ResyncJobError::BuddyComm(_) => Transience::Unknown,
            },
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::BuddyGroup(_)
            | Error::LockPlan(_)
            | Error::Encode(_)
            | Error::Decode(_)
            | Error::Config(ConfigError::Read { .. } | ConfigError::Parse { .. })
            | Error::Listener(_) => Effect::None,
            Error::Config(_) => Effect::Unknown,
            Error::BuddyComm(BuddyCommError::Write { .. }) => Effect::Unknown,
            Error::BuddyComm(_) => Effect::None,
            Error::Transport(TransportError::UnknownNode(_) | TransportError::Resolve { .. }) => {
                Effect::None
            }
            // Once bytes may have reached the peer the outcome is unknown.
            Error::Frame(_) | Error::Transport(_) | Error::MirrorSession(_) => Effect::Unknown,
            Error::Resync(ResyncError::InvalidPath(_)) => Effect::None,
            Error::Resync(_) => Effect::Unknown,
            Error::ResyncJob(ResyncJobError::AlreadyRunning(_))
            | Error::ResyncJob(ResyncJobError::MirrorRoot { .. })
            | Error::ResyncJob(ResyncJobError::NotADirectory(_)) => Effect::None,
            Error::ResyncJob(_) => Effect::Unknown,
        }
    }
}

fn io_transience(err: &io::Error) -> Transience {
    match err.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::TimedOut
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::Interrupted
        | io::ErrorKind::UnexpectedEof => Transience::Retryable,
        io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput => Transience::Permanent,
        _ => Transience::Unknown,
    }
}

fn frame_transience(err: &FrameError) -> Transience {
    match err {
        FrameError::Io(e) => io_transience(e),
        FrameError::FrameLengthInvalid { .. }
        | FrameError::FrameTooLarge { .. }
        | FrameError::FrameCrcMismatch { .. } => Transience::Permanent,
    }
}
