//! Concrete mirrored metadata operations.

use std::path::PathBuf;

use bytes::Bytes;

use super::proto::MirrorOp;
use super::request::{ExecContext, MirroredRequest, ResponseState};
use crate::core::layout::{dentry_path, inode_path};
use crate::core::{EntryId, OpsErr};
use crate::lockstore::{EntryLockStore, HeldLocks, LockMode, LockPlan, LockPlanError};
use crate::transport::PacketEncodeError;
use crate::transport::cbor::encoder;

/// Metadata primitives the operations apply against. [`DiskMetaStore`]
/// keeps them in the mirror-root layout; the test harness has an in-memory
/// version.
///
/// [`DiskMetaStore`]: crate::resync::DiskMetaStore
pub trait MetaStore: Send + Sync {
    fn lookup(&self, parent: &EntryId, name: &str) -> Result<Option<EntryId>, OpsErr>;

    fn create_file(&self, parent: &EntryId, name: &str, entry: &EntryId) -> Result<(), OpsErr>;

    /// Removes the dentry and returns the id it pointed to.
    fn unlink_file(&self, parent: &EntryId, name: &str) -> Result<EntryId, OpsErr>;

    /// Returns the open count after the call.
    fn open_file(&self, entry: &EntryId) -> Result<u32, OpsErr>;

    /// Returns the open count after the call.
    fn close_file(&self, entry: &EntryId) -> Result<u32, OpsErr>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryResponse {
    pub result: OpsErr,
    pub entry_id: Option<EntryId>,
}

impl EntryResponse {
    fn new(result: OpsErr, entry_id: Option<EntryId>) -> Self {
        Self { result, entry_id }
    }
}

impl ResponseState for EntryResponse {
    fn result(&self) -> OpsErr {
        self.result
    }

    fn set_result(&mut self, result: OpsErr) {
        self.result = result;
    }

    fn encode(&self) -> Result<Bytes, PacketEncodeError> {
        let mut buf = Vec::new();
        let mut enc = encoder(&mut buf);
        enc.map(if self.entry_id.is_some() { 2 } else { 1 })?;
        enc.str("result")?.u32(self.result.code())?;
        if let Some(id) = &self.entry_id {
            enc.str("entry_id")?.str(id.as_str())?;
        }
        Ok(Bytes::from(buf))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseFileResponse {
    pub result: OpsErr,
    pub open_count: u32,
}

impl ResponseState for CloseFileResponse {
    fn result(&self) -> OpsErr {
        self.result
    }

    fn set_result(&mut self, result: OpsErr) {
        self.result = result;
    }

    fn encode(&self) -> Result<Bytes, PacketEncodeError> {
        let mut buf = Vec::new();
        let mut enc = encoder(&mut buf);
        enc.map(2)?;
        enc.str("result")?.u32(self.result.code())?;
        enc.str("open_count")?.u32(self.open_count)?;
        Ok(Bytes::from(buf))
    }
}

/// Create a file dentry `name` under `parent` pointing at `entry_id`.
#[derive(Clone, Debug)]
pub struct MkFile {
    pub parent: EntryId,
    pub name: String,
    pub entry_id: EntryId,
    pub mirrored: bool,
}

impl MirroredRequest for MkFile {
    type Response = EntryResponse;

    fn is_mirrored(&self) -> bool {
        self.mirrored
    }

    fn lock<'a>(&self, locks: &'a EntryLockStore) -> Result<HeldLocks<'a>, LockPlanError> {
        LockPlan::new()
            .dir_id(self.parent.clone(), LockMode::Read)
            .parent_name(self.parent.clone(), self.name.clone())
            .file_id(self.entry_id.clone(), LockMode::Write)
            .acquire(locks)
    }

    fn execute_locally(&mut self, ctx: &mut ExecContext<'_>, _is_secondary: bool) -> EntryResponse {
        match ctx.meta.create_file(&self.parent, &self.name, &self.entry_id) {
            Ok(()) => EntryResponse::new(OpsErr::Success, Some(self.entry_id.clone())),
            Err(err) => EntryResponse::new(err, None),
        }
    }

    fn forward_request(&self, _response: &EntryResponse) -> MirrorOp {
        MirrorOp::MkFile {
            parent: self.parent.clone(),
            name: self.name.clone(),
            entry_id: self.entry_id.clone(),
        }
    }

    fn modified_paths(&self, _response: &EntryResponse) -> Vec<PathBuf> {
        vec![
            dentry_path(&self.parent, &self.name),
            inode_path(&self.entry_id),
        ]
    }

    fn error_response(&self, result: OpsErr) -> EntryResponse {
        EntryResponse::new(result, None)
    }

    fn log_context(&self) -> &'static str {
        "mk_file"
    }
}

/// Remove the file dentry `name` under `parent`.
#[derive(Clone, Debug)]
pub struct UnlinkFile {
    pub parent: EntryId,
    pub name: String,
    pub mirrored: bool,
}

impl MirroredRequest for UnlinkFile {
    type Response = EntryResponse;

    fn is_mirrored(&self) -> bool {
        self.mirrored
    }

    fn lock<'a>(&self, locks: &'a EntryLockStore) -> Result<HeldLocks<'a>, LockPlanError> {
        LockPlan::new()
            .dir_id(self.parent.clone(), LockMode::Read)
            .parent_name(self.parent.clone(), self.name.clone())
            .acquire(locks)
    }

    fn execute_locally(&mut self, ctx: &mut ExecContext<'_>, _is_secondary: bool) -> EntryResponse {
        let target = match ctx.meta.lookup(&self.parent, &self.name) {
            Ok(Some(target)) => target,
            Ok(None) => return EntryResponse::new(OpsErr::PathNotExists, None),
            Err(err) => return EntryResponse::new(err, None),
        };
        // The file id comes after the name lock in canonical order, and the
        // name lock keeps the dentry from changing underneath us.
        let _file = ctx.locks.lock_file_id(&target, LockMode::Write);
        match ctx.meta.unlink_file(&self.parent, &self.name) {
            Ok(unlinked) => EntryResponse::new(OpsErr::Success, Some(unlinked)),
            Err(err) => EntryResponse::new(err, None),
        }
    }

    fn forward_request(&self, _response: &EntryResponse) -> MirrorOp {
        MirrorOp::UnlinkFile {
            parent: self.parent.clone(),
            name: self.name.clone(),
        }
    }

    fn modified_paths(&self, response: &EntryResponse) -> Vec<PathBuf> {
        let mut paths = vec![dentry_path(&self.parent, &self.name)];
        paths.extend(response.entry_id.as_ref().map(inode_path));
        paths
    }

    fn error_response(&self, result: OpsErr) -> EntryResponse {
        EntryResponse::new(result, None)
    }

    fn log_context(&self) -> &'static str {
        "unlink_file"
    }
}

#[derive(Clone, Debug)]
pub struct CloseFile {
    pub entry_id: EntryId,
    pub mirrored: bool,
}

impl MirroredRequest for CloseFile {
    type Response = CloseFileResponse;

    fn is_mirrored(&self) -> bool {
        self.mirrored
    }

    fn lock<'a>(&self, locks: &'a EntryLockStore) -> Result<HeldLocks<'a>, LockPlanError> {
        LockPlan::new()
            .file_id(self.entry_id.clone(), LockMode::Write)
            .acquire(locks)
    }

    fn execute_locally(
        &mut self,
        ctx: &mut ExecContext<'_>,
        _is_secondary: bool,
    ) -> CloseFileResponse {
        match ctx.meta.close_file(&self.entry_id) {
            Ok(open_count) => CloseFileResponse {
                result: OpsErr::Success,
                open_count,
            },
            Err(err) => self.error_response(err),
        }
    }

    fn forward_request(&self, _response: &CloseFileResponse) -> MirrorOp {
        MirrorOp::CloseFile {
            entry_id: self.entry_id.clone(),
        }
    }

    fn modified_paths(&self, _response: &CloseFileResponse) -> Vec<PathBuf> {
        vec![inode_path(&self.entry_id)]
    }

    fn error_response(&self, result: OpsErr) -> CloseFileResponse {
        CloseFileResponse {
            result,
            open_count: 0,
        }
    }

    fn log_context(&self) -> &'static str {
        "close_file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeId;
    use crate::test_harness::MemMetaStore;

    fn ctx<'a>(meta: &'a MemMetaStore, locks: &'a EntryLockStore) -> ExecContext<'a> {
        ExecContext {
            meta,
            locks,
            requestor: NodeId::new(1),
        }
    }

    #[test]
    fn mk_file_then_unlink() {
        let meta = MemMetaStore::new();
        let locks = EntryLockStore::default();
        let root = EntryId::new("root");

        let mut mk = MkFile {
            parent: root.clone(),
            name: "a".to_string(),
            entry_id: EntryId::new("f-1"),
            mirrored: true,
        };
        let response = mk.execute_locally(&mut ctx(&meta, &locks), false);
        assert_eq!(response.result, OpsErr::Success);
        assert_eq!(
            meta.lookup(&root, "a").unwrap(),
            Some(EntryId::new("f-1"))
        );

        let again = mk.execute_locally(&mut ctx(&meta, &locks), false);
        assert_eq!(again.result, OpsErr::Exists);
        assert!(!again.changes_observable_state());

        let mut unlink = UnlinkFile {
            parent: root.clone(),
            name: "a".to_string(),
            mirrored: true,
        };
        let response = unlink.execute_locally(&mut ctx(&meta, &locks), false);
        assert_eq!(response.entry_id, Some(EntryId::new("f-1")));
        assert_eq!(locks.file_id_stats().total_refs, 0);

        assert_eq!(
            unlink.modified_paths(&response),
            vec![PathBuf::from("dentries/root/a"), PathBuf::from("inodes/f-1")]
        );

        let missing = unlink.execute_locally(&mut ctx(&meta, &locks), false);
        assert_eq!(missing.result, OpsErr::PathNotExists);
    }

    #[test]
    fn mk_file_locks_parent_name_and_new_id() {
        let locks = EntryLockStore::default();
        let mk = MkFile {
            parent: EntryId::new("root"),
            name: "a".to_string(),
            entry_id: EntryId::new("f-1"),
            mirrored: false,
        };
        let held = mk.lock(&locks).unwrap();
        assert_eq!(held.len(), 3);
        assert!(
            locks
                .try_lock_file_id(&EntryId::new("f-1"), LockMode::Read)
                .is_none()
        );
        assert!(
            locks
                .try_lock_file_id(&EntryId::new("root"), LockMode::Read)
                .is_some()
        );
    }

    #[test]
    fn close_file_reports_open_count() {
        let meta = MemMetaStore::new();
        let locks = EntryLockStore::default();
        let id = EntryId::new("f-2");
        meta.create_file(&EntryId::new("root"), "b", &id).unwrap();
        meta.open_file(&id).unwrap();
        meta.open_file(&id).unwrap();

        let mut close = CloseFile {
            entry_id: id.clone(),
            mirrored: true,
        };
        let response = close.execute_locally(&mut ctx(&meta, &locks), false);
        assert_eq!(response.open_count, 1);
        assert_eq!(
            close.forward_request(&response),
            MirrorOp::CloseFile { entry_id: id }
        );
    }

    #[test]
    fn response_encoding_carries_result_code() {
        let response = EntryResponse::new(OpsErr::Exists, None);
        let bytes = response.encode().unwrap();
        let mut dec = minicbor::Decoder::new(&bytes);
        assert_eq!(dec.map().unwrap(), Some(1));
        assert_eq!(dec.str().unwrap(), "result");
        assert_eq!(dec.u32().unwrap(), OpsErr::Exists.code());
    }
}
