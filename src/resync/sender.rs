//! Primary side of the raw resync stream.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::candidate::{CandidateKind, SyncCandidate};
use super::error::ResyncError;
use super::packet::{ResyncAck, ResyncPacket, ResyncSessionParams, XAttrRecord};
use super::raw_store::{FSID_DIR, RawMetaSource, SourceEntry, USER_XATTR_PREFIX, wire_path};
use super::sync_slave::CandidateApplier;
use crate::core::{MetaPath, OpsErr};
use crate::lockstore::{EntryLockStore, HeldLocks, LockMode, LockPlan};
use crate::transport::{DecodeLimits, FrameReader, FrameWriter};

/// One open resync session.
pub struct ResyncStreamSender<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    params: ResyncSessionParams,
    limits: DecodeLimits,
    packets_sent: u64,
}

impl ResyncStreamSender<TcpStream, TcpStream> {
    pub fn connect(
        config: &ResyncSenderConfig,
        params: ResyncSessionParams,
    ) -> Result<Self, ResyncError> {
        let addr = config
            .addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no socket address"))?;
        let stream = TcpStream::connect_timeout(&addr, config.timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.timeout))?;
        stream.set_write_timeout(Some(config.timeout))?;
        Self::open(stream.try_clone()?, stream, config.max_frame_bytes, params)
    }
}

impl<R: Read, W: Write> ResyncStreamSender<R, W> {
    /// Sends the session header and waits for the receiver to accept it.
    pub fn open(
        reader: R,
        writer: W,
        max_frame_bytes: usize,
        params: ResyncSessionParams,
    ) -> Result<Self, ResyncError> {
        let mut sender = Self {
            reader: FrameReader::new(reader, max_frame_bytes),
            writer: FrameWriter::new(writer, max_frame_bytes),
            params,
            limits: DecodeLimits::default(),
            packets_sent: 0,
        };
        sender.writer.write_frame(&sender.params.encode()?)?;
        match sender.read_ack()? {
            OpsErr::Success => Ok(sender),
            result => Err(ResyncError::Rejected(result)),
        }
    }

    pub fn params(&self) -> &ResyncSessionParams {
        &self.params
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Sends one packet, followed by its `user.` xattrs when the session
    /// syncs them, and waits for the ack. A rejected packet ends the session.
    pub fn send(
        &mut self,
        packet: &ResyncPacket,
        xattrs: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), ResyncError> {
        self.writer.write_frame(&packet.encode()?)?;
        if packet.carries_xattrs(&self.params) {
            for (name, value) in xattrs {
                let Some(name) = name.strip_prefix(USER_XATTR_PREFIX) else {
                    continue;
                };
                if name.is_empty() {
                    continue;
                }
                let record = XAttrRecord::Entry {
                    name: name.to_string(),
                    value: value.clone(),
                };
                self.writer.write_frame(&record.encode()?)?;
            }
            self.writer.write_frame(&XAttrRecord::End.encode()?)?;
        }
        self.packets_sent += 1;
        match self.read_ack()? {
            OpsErr::Success => Ok(()),
            result => {
                // The session result follows a failed packet ack.
                let session = self.read_ack().unwrap_or(result);
                Err(ResyncError::Rejected(session))
            }
        }
    }

    /// Ends the stream and returns once the receiver reports success.
    pub fn finish(mut self) -> Result<(), ResyncError> {
        self.writer.write_end()?;
        match self.read_ack()? {
            OpsErr::Success => Ok(()),
            result => Err(ResyncError::Rejected(result)),
        }
    }

    fn read_ack(&mut self) -> Result<OpsErr, ResyncError> {
        let body = self.reader.read_next()?.ok_or(ResyncError::UnexpectedEof)?;
        Ok(ResyncAck::decode(&body, &self.limits)?.result)
    }
}

#[derive(Clone, Debug)]
pub struct ResyncSenderConfig {
    /// Address of the secondary's resync listener.
    pub addr: String,
    pub timeout: Duration,
    pub max_frame_bytes: usize,
    pub sync_xattrs: bool,
}

fn to_wire(path: &Path) -> Result<String, ResyncError> {
    wire_path(path).ok_or_else(|| ResyncError::InvalidPath(path.to_path_buf()))
}

fn parent_of(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

/// Read locks held while `path` is read and streamed. A directory is keyed
/// by its own entry id, anything else by the dentry or inode it stores.
fn lock_entry<'a>(
    locks: &'a EntryLockStore,
    path: &Path,
    is_dir: bool,
) -> Result<HeldLocks<'a>, ResyncError> {
    let plan = match MetaPath::classify(path, is_dir) {
        MetaPath::Unowned => LockPlan::new(),
        MetaPath::Dir(id) => LockPlan::new().dir_id(id, LockMode::Read),
        MetaPath::Dentry { parent, name } => LockPlan::new().parent_name(parent, name),
        MetaPath::Inode(id) => LockPlan::new().file_id(id, LockMode::Read),
    };
    Ok(plan.acquire(locks)?)
}

/// Streams a directory candidate: the directory itself, its subdirectories
/// (with the fsid inodes) and then its files, as one whole-directory
/// session. Subdirectory contents are separate candidates.
///
/// The directory stays read-locked for the session; each entry is locked
/// while it is read and acknowledged.
pub fn sync_directory(
    source: &dyn RawMetaSource,
    config: &ResyncSenderConfig,
    locks: &EntryLockStore,
    dir: &Path,
) -> Result<u64, ResyncError> {
    let dir_lock = lock_entry(locks, dir, true)?;
    let xattrs = match source.read_entry(dir).map_err(ResyncError::Rejected)? {
        Some(SourceEntry::Directory { xattrs }) => xattrs,
        Some(_) => {
            drop(dir_lock);
            return sync_file(source, config, locks, dir);
        }
        None => {
            if dir.as_os_str().is_empty() {
                return Err(ResyncError::Rejected(OpsErr::PathNotExists));
            }
            let mut sender =
                ResyncStreamSender::connect(config, single_params(dir, config, false)?)?;
            sender.send(&ResyncPacket::directory_tombstone(to_wire(dir)?), &BTreeMap::new())?;
            sender.finish()?;
            return Ok(1);
        }
    };

    let params = ResyncSessionParams {
        base_path: to_wire(dir)?,
        whole_directory: true,
        sync_xattrs: config.sync_xattrs,
    };
    let mut sender = ResyncStreamSender::connect(config, params)?;
    sender.send(&ResyncPacket::directory(to_wire(dir)?), &xattrs)?;

    let entries = source.list_dir(dir).map_err(ResyncError::Rejected)?;
    for entry in entries.iter().filter(|entry| entry.is_dir) {
        let path = dir.join(&entry.name);
        {
            let _dentry = lock_entry(locks, &path, false)?;
            let Some(SourceEntry::Directory { xattrs }) =
                source.read_entry(&path).map_err(ResyncError::Rejected)?
            else {
                continue;
            };
            sender.send(&ResyncPacket::directory(to_wire(&path)?), &xattrs)?;
        }
        if entry.name == FSID_DIR {
            for inode in source.list_dir(&path).map_err(ResyncError::Rejected)? {
                if !inode.is_dir {
                    let inode_path = path.join(&inode.name);
                    let _inode = lock_entry(locks, &inode_path, false)?;
                    send_entry(&mut sender, source, &inode_path)?;
                }
            }
        }
    }
    for entry in entries.iter().filter(|entry| !entry.is_dir) {
        let path = dir.join(&entry.name);
        let _dentry = lock_entry(locks, &path, false)?;
        send_entry(&mut sender, source, &path)?;
    }
    let sent = sender.packets_sent();
    sender.finish()?;
    drop(dir_lock);
    Ok(sent)
}

/// Streams one entry in a session based at its parent, holding the entry's
/// lock until the receiver acknowledged it. A missing entry is sent as a
/// tombstone.
pub fn sync_file(
    source: &dyn RawMetaSource,
    config: &ResyncSenderConfig,
    locks: &EntryLockStore,
    path: &Path,
) -> Result<u64, ResyncError> {
    let _held = lock_entry(locks, path, false)?;
    let mut sender = ResyncStreamSender::connect(config, single_params(path, config, true)?)?;
    let sent = send_entry(&mut sender, source, path)?;
    if !sent {
        sender.send(&ResyncPacket::inode_tombstone(to_wire(path)?), &BTreeMap::new())?;
    }
    let count = sender.packets_sent();
    sender.finish()?;
    Ok(count)
}

fn single_params(
    path: &Path,
    config: &ResyncSenderConfig,
    sync_xattrs: bool,
) -> Result<ResyncSessionParams, ResyncError> {
    Ok(ResyncSessionParams {
        base_path: to_wire(&parent_of(path))?,
        whole_directory: false,
        sync_xattrs: sync_xattrs && config.sync_xattrs,
    })
}

/// Returns `false` when nothing exists at `path`.
fn send_entry<R: Read, W: Write>(
    sender: &mut ResyncStreamSender<R, W>,
    source: &dyn RawMetaSource,
    path: &Path,
) -> Result<bool, ResyncError> {
    let wire = to_wire(path)?;
    let none = BTreeMap::new();
    match source.read_entry(path).map_err(ResyncError::Rejected)? {
        Some(SourceEntry::Inode { content, xattrs }) => {
            sender.send(&ResyncPacket::inode(wire, content), &xattrs)?;
        }
        Some(SourceEntry::FsIdLink { fs_id }) => {
            sender.send(&ResyncPacket::fs_id_link(wire, fs_id), &none)?;
        }
        Some(SourceEntry::Directory { xattrs }) => {
            sender.send(&ResyncPacket::directory(wire), &xattrs)?;
        }
        None => return Ok(false),
    }
    Ok(true)
}

/// Applies candidates by streaming them to the secondary under the same
/// entry locks mirrored operations take.
pub struct StreamCandidateApplier {
    source: Arc<dyn RawMetaSource>,
    locks: Arc<EntryLockStore>,
    config: ResyncSenderConfig,
}

impl StreamCandidateApplier {
    pub fn new(
        source: Arc<dyn RawMetaSource>,
        locks: Arc<EntryLockStore>,
        config: ResyncSenderConfig,
    ) -> Self {
        Self {
            source,
            locks,
            config,
        }
    }
}

impl CandidateApplier for StreamCandidateApplier {
    fn apply(&self, candidate: &SyncCandidate) -> Result<(), OpsErr> {
        let source = self.source.as_ref();
        let synced = match candidate.kind {
            CandidateKind::Dir => {
                sync_directory(source, &self.config, &self.locks, candidate.path())
            }
            CandidateKind::File => sync_file(source, &self.config, &self.locks, candidate.path()),
        };
        match synced {
            Ok(packets) => {
                tracing::debug!(
                    path = %candidate.path().display(),
                    kind = candidate.kind.as_str(),
                    packets,
                    "candidate synced"
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    path = %candidate.path().display(),
                    kind = candidate.kind.as_str(),
                    error = %err,
                    "candidate sync failed"
                );
                Err(err.ops_err())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::core::EntryId;
    use crate::transport::encode_frame;

    fn ack_stream(results: &[OpsErr]) -> Vec<u8> {
        let mut out = Vec::new();
        for result in results {
            out.extend(encode_frame(&ResyncAck::new(*result).encode().unwrap(), 1 << 20).unwrap());
        }
        out
    }

    fn params(sync_xattrs: bool) -> ResyncSessionParams {
        ResyncSessionParams {
            base_path: "a".into(),
            whole_directory: true,
            sync_xattrs,
        }
    }

    #[test]
    fn rejected_header_fails_open() {
        let acks = ack_stream(&[OpsErr::NotSupported]);
        let result = ResyncStreamSender::open(Cursor::new(acks), Vec::new(), 1 << 20, params(true));
        assert!(matches!(result, Err(ResyncError::Rejected(OpsErr::NotSupported))));
    }

    #[test]
    fn failed_packet_reports_session_result() {
        let acks = ack_stream(&[OpsErr::Success, OpsErr::Internal, OpsErr::Internal]);
        let mut sender =
            ResyncStreamSender::open(Cursor::new(acks), Vec::new(), 1 << 20, params(false))
                .unwrap();
        let err = sender
            .send(&ResyncPacket::inode("a/f", b"x".to_vec()), &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, ResyncError::Rejected(OpsErr::Internal)));
        assert_eq!(sender.packets_sent(), 1);
    }

    #[test]
    fn only_user_xattrs_are_streamed() {
        let acks = ack_stream(&[OpsErr::Success, OpsErr::Success, OpsErr::Success]);
        let mut sender =
            ResyncStreamSender::open(Cursor::new(acks), Vec::new(), 1 << 20, params(true))
                .unwrap();
        let xattrs: BTreeMap<String, Vec<u8>> = [
            ("user.keep".to_string(), b"1".to_vec()),
            ("trusted.skip".to_string(), b"2".to_vec()),
        ]
        .into_iter()
        .collect();
        sender
            .send(&ResyncPacket::inode("a/f", b"x".to_vec()), &xattrs)
            .unwrap();
        let written = sender.writer.get_ref().clone();
        sender.finish().unwrap();

        let mut reader = FrameReader::new(Cursor::new(written), 1 << 20);
        let limits = DecodeLimits::default();
        let header = reader.read_next().unwrap().unwrap();
        assert!(ResyncSessionParams::decode(&header, &limits).unwrap().sync_xattrs);
        let packet = reader.read_next().unwrap().unwrap();
        assert_eq!(ResyncPacket::decode(&packet, &limits).unwrap().path(), "a/f");
        let first = reader.read_next().unwrap().unwrap();
        assert_eq!(
            XAttrRecord::decode(&first, &limits).unwrap(),
            XAttrRecord::Entry {
                name: "keep".into(),
                value: b"1".to_vec()
            }
        );
        let end = reader.read_next().unwrap().unwrap();
        assert_eq!(XAttrRecord::decode(&end, &limits).unwrap(), XAttrRecord::End);
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn inode_lock_waits_for_the_operation_holding_it() {
        use crate::mirror::{CloseFile, MirroredRequest};
        use crossbeam::channel;
        use std::thread;

        let store = EntryLockStore::default();
        let close = CloseFile {
            entry_id: EntryId::new("f-1"),
            mirrored: true,
        };
        let held = close.lock(&store).unwrap();

        let (tx, rx) = channel::bounded(1);
        thread::scope(|scope| {
            scope.spawn(|| {
                let _resync = lock_entry(&store, Path::new("inodes/f-1"), false).unwrap();
                tx.send(()).unwrap();
            });
            assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
            drop(held);
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        });
    }

    #[test]
    fn entry_locks_follow_the_layout() {
        let store = EntryLockStore::default();
        let dir = lock_entry(&store, Path::new("dentries/d-1"), true).unwrap();
        assert!(
            store
                .try_lock_file_id(&EntryId::new("d-1"), LockMode::Write)
                .is_none()
        );
        assert!(
            store
                .try_lock_file_id(&EntryId::new("d-1"), LockMode::Read)
                .is_some()
        );
        drop(dir);

        let dentry = lock_entry(&store, Path::new("dentries/d-1/a"), false).unwrap();
        assert_eq!(dentry.len(), 1);
        assert_eq!(store.parent_name_stats().total_refs, 1);
        drop(dentry);

        let fsid = lock_entry(&store, Path::new("d/#fSiDs#/f-2"), false).unwrap();
        assert!(
            store
                .try_lock_file_id(&EntryId::new("f-2"), LockMode::Write)
                .is_none()
        );
        drop(fsid);

        assert!(lock_entry(&store, Path::new(""), true).unwrap().is_empty());
    }
}
