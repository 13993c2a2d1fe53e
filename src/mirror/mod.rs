//! Request mirroring between the primary and secondary of a buddy group.

pub mod executor;
pub mod messenger;
pub mod ops;
pub mod proto;
pub mod request;
pub mod server;
pub mod sessions;

pub use executor::{
    ForwardVerdict, MirrorExecutor, MirrorExecutorConfig, MirrorOutcome, ResyncReason, SkipReason,
};
pub use messenger::{Messenger, TargetRoutes, TcpMessenger, TcpMessengerConfig, TransportError};
pub use ops::{CloseFile, CloseFileResponse, EntryResponse, MetaStore, MkFile, UnlinkFile};
pub use proto::{BUDDY_MIRROR_SECOND, MirrorOp, MirrorRequest, MirrorResponse};
pub use request::{ExecContext, MirroredRequest, RequestMeta, ResponseState};
pub use server::{
    MetaRequestHandler, MirrorServer, MirrorServerConfig, MirrorSessionError, RequestHandler,
};
pub use sessions::{MirrorSessions, PendingForward, SeqAcquire, SessionTicket};
