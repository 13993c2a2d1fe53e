//! Buddy resync: candidate discovery on the primary and the raw
//! inode/dentry stream that applies candidates on the secondary.

pub mod candidate;
pub mod disk_store;
mod error;
pub mod gather;
pub mod handler;
pub mod job;
pub mod modsync;
pub mod packet;
pub mod raw_store;
pub mod sender;
pub mod server;
pub mod slave;
pub mod sync_slave;
pub mod watermark;
pub mod work_queue;

pub use candidate::{CandidateKind, SyncCandidate, SyncCandidateStore};
pub use disk_store::DiskMetaStore;
pub use error::ResyncError;
pub use gather::{GatherSlave, GatherSlaveConfig, GatherStats, GatherStatsSnapshot};
pub use handler::RawResyncHandler;
pub use job::{ResyncJob, ResyncJobConfig, ResyncJobError, ResyncJobState, ResyncJobStats};
pub use modsync::{ModificationGuard, ModificationLog, Quiesced};
pub use packet::{DentryLink, ResyncAck, ResyncPacket, ResyncSessionParams, XAttrRecord};
pub use raw_store::{
    FSID_DIR, IncompleteInode, RawDirEntry, RawMetaSource, RawMetaStore, SourceEntry,
};
pub use sender::{
    ResyncSenderConfig, ResyncStreamSender, StreamCandidateApplier, sync_directory, sync_file,
};
pub use server::{ResyncServer, ResyncServerConfig};
pub use slave::SlaveControl;
pub use sync_slave::{CandidateApplier, SyncSlave, SyncStatsSnapshot};
pub use watermark::Watermark;
pub use work_queue::GatherWorkQueue;
