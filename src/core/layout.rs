//! Where metadata entries live below a target's mirror root.
//!
//! ```text
//! dentries/<dir entry id>/<name>   dentry `name` of that directory
//! inodes/<entry id>                file inode
//! <dir>/#fSiDs#/<entry id>         inode shared by hard-linked dentries
//! ```
//!
//! Resync reads the tree by path while mirrored operations lock entry ids.
//! [`MetaPath::classify`] maps one onto the other: a directory is keyed by
//! its last path component, an entry inside an inode directory by its name
//! and any other entry by its parent directory and name.

use std::path::{Path, PathBuf};

use super::EntryId;

pub const DENTRIES_DIR: &str = "dentries";
pub const INODES_DIR: &str = "inodes";
/// Entry id of the file system root directory.
pub const ROOT_DIR_ID: &str = "root";
/// Per-directory subdirectory holding inodes that hard-linked dentries share.
pub const FSID_DIR: &str = "#fSiDs#";

pub fn content_dir_path(dir: &EntryId) -> PathBuf {
    Path::new(DENTRIES_DIR).join(dir.as_str())
}

pub fn dentry_path(parent: &EntryId, name: &str) -> PathBuf {
    content_dir_path(parent).join(name)
}

pub fn inode_path(entry: &EntryId) -> PathBuf {
    Path::new(INODES_DIR).join(entry.as_str())
}

/// Whether `id` can name a single path component.
pub fn is_valid_component(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains('/') && !id.contains('\0')
}

/// Entry-lock identity of a path below the mirror root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetaPath {
    /// The mirror root or an entry directly below it.
    Unowned,
    Dir(EntryId),
    Dentry { parent: EntryId, name: String },
    Inode(EntryId),
}

impl MetaPath {
    pub fn classify(path: &Path, is_dir: bool) -> MetaPath {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return MetaPath::Unowned;
        };
        if is_dir {
            return MetaPath::Dir(EntryId::new(name));
        }
        let Some(parent) = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|parent| parent.to_str())
        else {
            return MetaPath::Unowned;
        };
        if parent == INODES_DIR || parent == FSID_DIR {
            MetaPath::Inode(EntryId::new(name))
        } else {
            MetaPath::Dentry {
                parent: EntryId::new(parent),
                name: name.to_string(),
            }
        }
    }
}
