//! Raw metadata primitives the resync stream applies packets through.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::core::OpsErr;
pub use crate::core::layout::FSID_DIR;

/// Prefix of the xattr namespace that is mirrored.
pub const USER_XATTR_PREFIX: &str = "user.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawDirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// An inode being rewritten by a resync packet.
pub trait IncompleteInode {
    fn set_content(&mut self, content: &[u8]) -> Result<(), OpsErr>;

    /// `name` carries its namespace prefix.
    fn set_xattr(&mut self, name: &str, value: &[u8]) -> Result<(), OpsErr>;

    /// Drops every xattr not set through this handle.
    fn clear_unset_xattrs(&mut self) -> Result<(), OpsErr>;
}

/// Receive side. All paths are relative to the mirror root.
pub trait RawMetaStore: Send + Sync {
    /// Creates (or truncates) the inode at `path`, creating missing parents.
    fn begin_resync_for(
        &self,
        path: &Path,
        is_dir: bool,
    ) -> Result<Box<dyn IncompleteInode + '_>, OpsErr>;

    /// Unlinks a non-directory entry. `PathNotExists` when absent.
    fn unlink_raw_metadata(&self, path: &Path) -> Result<(), OpsErr>;

    /// Removes a file or a whole directory tree. Absent entries are fine.
    fn remove_raw(&self, path: &Path, is_dir: bool) -> Result<(), OpsErr>;

    /// Hard-links `path` to `<parent>/#fSiDs#/<fs_id>`.
    fn link_to_fs_id(&self, path: &Path, fs_id: &str) -> Result<(), OpsErr>;

    fn list_dir(&self, path: &Path) -> Result<Vec<RawDirEntry>, OpsErr>;
}

/// What the primary finds on disk for one path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceEntry {
    Directory {
        xattrs: BTreeMap<String, Vec<u8>>,
    },
    Inode {
        content: Vec<u8>,
        xattrs: BTreeMap<String, Vec<u8>>,
    },
    /// A dentry sharing its inode with `<parent>/#fSiDs#/<fs_id>`.
    FsIdLink {
        fs_id: String,
    },
}

/// Send side: read access to the primary's raw metadata.
pub trait RawMetaSource: Send + Sync {
    fn list_dir(&self, path: &Path) -> Result<Vec<RawDirEntry>, OpsErr>;

    /// `None` when nothing exists at `path`.
    fn read_entry(&self, path: &Path) -> Result<Option<SourceEntry>, OpsErr>;
}

/// Normalises a wire path into a relative path below the mirror root. A
/// leading `/` is ignored; `..` components are rejected.
pub fn relative_wire_path(raw: &str) -> Result<PathBuf, OpsErr> {
    let mut out = PathBuf::new();
    for component in Path::new(raw.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(OpsErr::Inval);
            }
        }
    }
    Ok(out)
}

/// Renders a relative path for the wire.
pub fn wire_path(path: &Path) -> Option<String> {
    path.to_str().map(str::to_string)
}
