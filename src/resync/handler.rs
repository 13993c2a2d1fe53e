//! Receive side of the raw inode/dentry resync stream.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use super::error::ResyncError;
use super::packet::{DentryLink, ResyncAck, ResyncPacket, ResyncSessionParams, XAttrRecord};
use super::raw_store::{RawMetaStore, USER_XATTR_PREFIX, relative_wire_path};
use crate::core::OpsErr;
use crate::transport::{DecodeLimits, Frame, FrameReader, FrameWriter};

type XAttrs = Vec<(String, Vec<u8>)>;

/// Applies one resync session to a [`RawMetaStore`].
pub struct RawResyncHandler<'a> {
    store: &'a dyn RawMetaStore,
    store_client_xattrs: bool,
    limits: DecodeLimits,
}

impl<'a> RawResyncHandler<'a> {
    pub fn new(store: &'a dyn RawMetaStore, store_client_xattrs: bool) -> Self {
        Self {
            store,
            store_client_xattrs,
            limits: DecodeLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: DecodeLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Runs the session whose header has already been read.
    ///
    /// Returns the session result that was sent to the peer. Transport and
    /// protocol violations surface as `Err`; protocol violations are
    /// acknowledged with `Inval` first.
    pub fn run<R: Read, W: Write>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
        params: &ResyncSessionParams,
    ) -> Result<OpsErr, ResyncError> {
        let mut session = match self.open(params) {
            Ok(session) => session,
            Err(result) => {
                tracing::warn!(base = %params.base_path, %result, "resync session refused");
                write_ack(writer, result)?;
                return Ok(result);
            }
        };
        write_ack(writer, OpsErr::Success)?;

        loop {
            let (packet, xattrs) = match self.read_packet(reader, params) {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(err @ (ResyncError::Decode(_) | ResyncError::UnexpectedEnd)) => {
                    tracing::warn!(base = %params.base_path, error = %err, "malformed resync record");
                    write_ack(writer, OpsErr::Inval)?;
                    write_ack(writer, OpsErr::Inval)?;
                    return Err(err);
                }
                Err(err) => return Err(err),
            };

            let result = session.apply(&packet, xattrs.as_deref());
            write_ack(writer, result)?;
            if result != OpsErr::Success {
                tracing::warn!(
                    path = %packet.path(),
                    kind = packet.kind(),
                    %result,
                    "resync packet failed"
                );
                write_ack(writer, result)?;
                return Ok(result);
            }
            tracing::trace!(path = %packet.path(), kind = packet.kind(), "resync packet applied");
        }

        let result = session.finish();
        if result != OpsErr::Success {
            tracing::warn!(base = %params.base_path, %result, "removing untouched entries failed");
        }
        write_ack(writer, result)?;
        Ok(result)
    }

    fn open(&self, params: &ResyncSessionParams) -> Result<Session<'a>, OpsErr> {
        if params.sync_xattrs && !self.store_client_xattrs {
            return Err(OpsErr::NotSupported);
        }
        let base = relative_wire_path(&params.base_path)?;
        // The base must exist even when the primary sends no entries for it.
        if params.whole_directory {
            self.store.begin_resync_for(&base, true)?;
        }
        Ok(Session {
            store: self.store,
            base,
            whole_directory: params.whole_directory,
            written: Vec::new(),
        })
    }

    /// Next packet with its xattr sub-stream, or `None` at the end marker.
    fn read_packet<R: Read>(
        &self,
        reader: &mut FrameReader<R>,
        params: &ResyncSessionParams,
    ) -> Result<Option<(ResyncPacket, Option<XAttrs>)>, ResyncError> {
        let body = match reader.read_frame()? {
            Some(Frame::Data(body)) => body,
            Some(Frame::End) => return Ok(None),
            None => return Err(ResyncError::UnexpectedEof),
        };
        let packet = ResyncPacket::decode(&body, &self.limits)?;
        if !packet.carries_xattrs(params) {
            return Ok(Some((packet, None)));
        }
        let mut xattrs = Vec::new();
        loop {
            let body = match reader.read_frame()? {
                Some(Frame::Data(body)) => body,
                Some(Frame::End) => return Err(ResyncError::UnexpectedEnd),
                None => return Err(ResyncError::UnexpectedEof),
            };
            match XAttrRecord::decode(&body, &self.limits)? {
                XAttrRecord::Entry { name, value } => xattrs.push((name, value)),
                XAttrRecord::End => break,
            }
        }
        Ok(Some((packet, Some(xattrs))))
    }
}

struct Session<'a> {
    store: &'a dyn RawMetaStore,
    base: PathBuf,
    whole_directory: bool,
    /// Names directly below `base` that the primary sent.
    written: Vec<String>,
}

impl Session<'_> {
    fn apply(&mut self, packet: &ResyncPacket, xattrs: Option<&[(String, Vec<u8>)]>) -> OpsErr {
        let path = match relative_wire_path(packet.path()) {
            Ok(path) => path,
            Err(err) => return err,
        };
        if let Err(err) = self.record(&path) {
            return err;
        }
        let applied = match packet {
            ResyncPacket::Inode {
                content, deletion, ..
            } => self.apply_inode(&path, content, *deletion, false, xattrs),
            ResyncPacket::Directory { deletion, .. } => {
                self.apply_inode(&path, &[], *deletion, true, xattrs)
            }
            ResyncPacket::Dentry { link, .. } => match link {
                DentryLink::Inline { content, deletion } => {
                    self.apply_inode(&path, content, *deletion, false, None)
                }
                DentryLink::FsId { fs_id, deletion } => {
                    self.apply_fs_id_link(&path, fs_id, *deletion)
                }
            },
        };
        match applied {
            Ok(()) => OpsErr::Success,
            Err(err) => err,
        }
    }

    fn record(&mut self, path: &Path) -> Result<(), OpsErr> {
        let below = path.strip_prefix(&self.base).map_err(|_| OpsErr::Inval)?;
        if !self.whole_directory {
            return Ok(());
        }
        if let Some(Component::Normal(name)) = below.components().next() {
            let name = name.to_str().ok_or(OpsErr::Inval)?;
            self.written.push(name.to_string());
        }
        Ok(())
    }

    fn apply_inode(
        &self,
        path: &Path,
        content: &[u8],
        deletion: bool,
        is_dir: bool,
        xattrs: Option<&[(String, Vec<u8>)]>,
    ) -> Result<(), OpsErr> {
        if deletion {
            if path.as_os_str().is_empty() {
                return Err(OpsErr::Inval);
            }
            return self.store.remove_raw(path, is_dir);
        }

        if !is_dir && self.whole_directory {
            match self.store.unlink_raw_metadata(path) {
                Ok(()) | Err(OpsErr::PathNotExists) => {}
                Err(_) => return Err(OpsErr::Internal),
            }
        }

        let mut inode = self.store.begin_resync_for(path, is_dir)?;
        // Directory content is regenerated from the dentries that follow.
        if !is_dir {
            inode.set_content(content)?;
        }
        if let Some(xattrs) = xattrs {
            for (name, value) in xattrs {
                inode.set_xattr(&format!("{USER_XATTR_PREFIX}{name}"), value)?;
            }
            inode.clear_unset_xattrs()?;
        }
        Ok(())
    }

    fn apply_fs_id_link(&self, path: &Path, fs_id: &str, deletion: bool) -> Result<(), OpsErr> {
        match self.store.unlink_raw_metadata(path) {
            Ok(()) | Err(OpsErr::PathNotExists) => {}
            Err(_) => return Err(OpsErr::Internal),
        }
        if deletion {
            return Ok(());
        }
        self.store.link_to_fs_id(path, fs_id)
    }

    /// Removes everything below the base the primary did not send.
    fn finish(&mut self) -> OpsErr {
        if !self.whole_directory {
            return OpsErr::Success;
        }
        self.written.sort_unstable();
        self.written.dedup();
        let entries = match self.store.list_dir(&self.base) {
            Ok(entries) => entries,
            Err(err) => return err,
        };
        for entry in entries {
            if self.written.binary_search(&entry.name).is_ok() {
                continue;
            }
            let path = self.base.join(&entry.name);
            tracing::debug!(path = %path.display(), "removing entry absent on primary");
            if let Err(err) = self.store.remove_raw(&path, entry.is_dir) {
                tracing::warn!(path = %path.display(), %err, "failed to remove untouched entry");
                return OpsErr::Internal;
            }
        }
        OpsErr::Success
    }
}

fn write_ack<W: Write>(writer: &mut FrameWriter<W>, result: OpsErr) -> Result<(), ResyncError> {
    writer.write_frame(&ResyncAck::new(result).encode()?)?;
    Ok(())
}
