use std::path::PathBuf;

use thiserror::Error;

use crate::core::OpsErr;
use crate::lockstore::LockPlanError;
use crate::transport::{FrameError, PacketDecodeError, PacketEncodeError};

#[derive(Debug, Error)]
pub enum ResyncError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("decode error: {0}")]
    Decode(#[from] PacketDecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] PacketEncodeError),
    #[error("peer closed the stream mid-session")]
    UnexpectedEof,
    #[error("end marker where a record was expected")]
    UnexpectedEnd,
    #[error("receiver rejected the session: {0}")]
    Rejected(OpsErr),
    #[error("path cannot be sent: {0:?}")]
    InvalidPath(PathBuf),
    #[error("entry lock refused: {0}")]
    Lock(#[from] LockPlanError),
}

impl ResyncError {
    /// Result code reported for a session that ended with this error.
    pub fn ops_err(&self) -> OpsErr {
        match self {
            ResyncError::Io(_)
            | ResyncError::Frame(_)
            | ResyncError::UnexpectedEof => OpsErr::Communication,
            ResyncError::Decode(_) | ResyncError::UnexpectedEnd | ResyncError::InvalidPath(_) => {
                OpsErr::Inval
            }
            ResyncError::Encode(_) | ResyncError::Lock(_) => OpsErr::Internal,
            ResyncError::Rejected(err) => *err,
        }
    }

    pub fn is_disconnect(&self) -> bool {
        match self {
            ResyncError::Frame(err) => err.is_disconnect(),
            ResyncError::UnexpectedEof => true,
            _ => false,
        }
    }
}
