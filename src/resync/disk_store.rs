//! Raw metadata kept as a plain directory tree.
//!
//! Inode content is the file's bytes. Extended attributes live in CBOR
//! sidecars under a hidden `.xattrs` tree that mirrors the entry layout:
//! the attributes of `a/f` are stored in `.xattrs/a/f/#xattr#`.
//!
//! The store also applies mirrored operations, placing dentries and inodes
//! where [`crate::core::layout`] says: a dentry holds the entry id it points
//! at, an inode holds a CBOR record with the open count.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

use minicbor::Decoder;

use super::raw_store::{
    FSID_DIR, IncompleteInode, RawDirEntry, RawMetaSource, RawMetaStore, SourceEntry,
};
use crate::core::layout::{dentry_path, inode_path, is_valid_component};
use crate::core::{EntryId, OpsErr};
use crate::mirror::MetaStore;
use crate::transport::cbor::{
    DecodeLimits, decode_bytes, decode_map_len, decode_text, decode_u32, encoder,
    ensure_consumed,
};

pub const XATTR_DIR: &str = ".xattrs";
const XATTR_SIDECAR: &str = "#xattr#";

type XAttrMap = BTreeMap<String, Vec<u8>>;

pub struct DiskMetaStore {
    root: PathBuf,
    limits: DecodeLimits,
}

impl DiskMetaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            limits: DecodeLimits::default(),
        }
    }

    /// Creates the root directory when missing.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let store = Self::new(root);
        fs::create_dir_all(&store.root)?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn xattrs(&self, path: &Path) -> Result<XAttrMap, OpsErr> {
        self.resolve(path)?;
        self.load_xattrs(path)
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf, OpsErr> {
        match path.components().next() {
            Some(Component::Normal(first)) if first == XATTR_DIR => Err(OpsErr::Inval),
            Some(Component::Normal(_)) | None => Ok(self.root.join(path)),
            Some(_) => Err(OpsErr::Inval),
        }
    }

    fn sidecar_dir(&self, path: &Path) -> PathBuf {
        self.root.join(XATTR_DIR).join(path)
    }

    fn sidecar(&self, path: &Path) -> PathBuf {
        self.sidecar_dir(path).join(XATTR_SIDECAR)
    }

    fn load_xattrs(&self, path: &Path) -> Result<XAttrMap, OpsErr> {
        let sidecar = self.sidecar(path);
        let bytes = match fs::read(&sidecar) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(XAttrMap::new()),
            Err(err) => return Err(io_to_ops(&sidecar, err)),
        };
        decode_xattrs(&bytes, &self.limits).map_err(|reason| {
            tracing::warn!(path = %sidecar.display(), %reason, "corrupt xattr sidecar");
            OpsErr::Internal
        })
    }

    fn save_xattrs(&self, path: &Path, xattrs: &XAttrMap) -> Result<(), OpsErr> {
        let sidecar = self.sidecar(path);
        if xattrs.is_empty() {
            return match fs::remove_file(&sidecar) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(io_to_ops(&sidecar, err)),
            };
        }
        let bytes = encode_xattrs(xattrs).map_err(|reason| {
            tracing::warn!(path = %sidecar.display(), %reason, "xattr sidecar encode failed");
            OpsErr::Internal
        })?;
        let dir = self.sidecar_dir(path);
        atomic_write(&dir, &sidecar, &bytes).map_err(|err| io_to_ops(&sidecar, err))
    }

    fn remove_sidecars(&self, path: &Path) -> Result<(), OpsErr> {
        let dir = self.sidecar_dir(path);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_to_ops(&dir, err)),
        }
    }

    /// Finds the fsid entry sharing an inode with `path`, if any.
    fn fs_id_of(&self, path: &Path, meta: &fs::Metadata) -> Result<Option<String>, OpsErr> {
        let Some(parent) = path.parent() else {
            return Ok(None);
        };
        if parent.file_name().is_some_and(|name| name == FSID_DIR) || meta.nlink() < 2 {
            return Ok(None);
        }
        let fsid_dir = self.root.join(parent).join(FSID_DIR);
        let entries = match fs::read_dir(&fsid_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_to_ops(&fsid_dir, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|err| io_to_ops(&fsid_dir, err))?;
            let candidate = entry.metadata().map_err(|err| io_to_ops(&entry.path(), err))?;
            if candidate.ino() == meta.ino() && candidate.dev() == meta.dev() {
                return Ok(entry.file_name().to_str().map(str::to_string));
            }
        }
        Ok(None)
    }

    fn list(&self, path: &Path) -> Result<Vec<RawDirEntry>, OpsErr> {
        let dir = self.resolve(path)?;
        let entries = fs::read_dir(&dir).map_err(|err| io_to_ops(&dir, err))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_to_ops(&dir, err))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!(dir = %dir.display(), "skipping entry with non-UTF-8 name");
                continue;
            };
            if path.as_os_str().is_empty() && name == XATTR_DIR {
                continue;
            }
            let file_type = entry.file_type().map_err(|err| io_to_ops(&entry.path(), err))?;
            out.push(RawDirEntry {
                name,
                is_dir: file_type.is_dir(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

fn checked(component: &str) -> Result<(), OpsErr> {
    if is_valid_component(component) {
        Ok(())
    } else {
        Err(OpsErr::Inval)
    }
}

impl DiskMetaStore {
    fn read_open_count(&self, entry: &EntryId) -> Result<u32, OpsErr> {
        checked(entry.as_str())?;
        let path = self.root.join(inode_path(entry));
        let bytes = fs::read(&path).map_err(|err| io_to_ops(&path, err))?;
        decode_inode(&bytes, &self.limits).map_err(|reason| {
            tracing::warn!(path = %path.display(), %reason, "corrupt inode record");
            OpsErr::Internal
        })
    }

    fn write_open_count(&self, entry: &EntryId, open_count: u32) -> Result<(), OpsErr> {
        let path = self.root.join(inode_path(entry));
        let bytes = encode_inode(open_count).map_err(|reason| {
            tracing::warn!(path = %path.display(), %reason, "inode record encode failed");
            OpsErr::Internal
        })?;
        write_creating_parent(&path, &bytes).map_err(|err| io_to_ops(&path, err))
    }
}

impl MetaStore for DiskMetaStore {
    fn lookup(&self, parent: &EntryId, name: &str) -> Result<Option<EntryId>, OpsErr> {
        checked(parent.as_str())?;
        checked(name)?;
        let path = self.root.join(dentry_path(parent, name));
        match fs::read(&path) {
            Ok(bytes) => String::from_utf8(bytes)
                .map(|id| Some(EntryId::new(id)))
                .map_err(|_| {
                    tracing::warn!(path = %path.display(), "dentry is not an entry id");
                    OpsErr::Internal
                }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_to_ops(&path, err)),
        }
    }

    fn create_file(&self, parent: &EntryId, name: &str, entry: &EntryId) -> Result<(), OpsErr> {
        checked(entry.as_str())?;
        if self.lookup(parent, name)?.is_some() {
            return Err(OpsErr::Exists);
        }
        self.write_open_count(entry, 0)?;
        let path = self.root.join(dentry_path(parent, name));
        write_creating_parent(&path, entry.as_bytes()).map_err(|err| io_to_ops(&path, err))
    }

    fn unlink_file(&self, parent: &EntryId, name: &str) -> Result<EntryId, OpsErr> {
        let entry = self.lookup(parent, name)?.ok_or(OpsErr::PathNotExists)?;
        let dentry = self.root.join(dentry_path(parent, name));
        fs::remove_file(&dentry).map_err(|err| io_to_ops(&dentry, err))?;
        if is_valid_component(entry.as_str()) {
            let inode = self.root.join(inode_path(&entry));
            match fs::remove_file(&inode) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_to_ops(&inode, err)),
            }
        }
        Ok(entry)
    }

    fn open_file(&self, entry: &EntryId) -> Result<u32, OpsErr> {
        let open_count = self.read_open_count(entry)?.saturating_add(1);
        self.write_open_count(entry, open_count)?;
        Ok(open_count)
    }

    fn close_file(&self, entry: &EntryId) -> Result<u32, OpsErr> {
        let open_count = self.read_open_count(entry)?.saturating_sub(1);
        self.write_open_count(entry, open_count)?;
        Ok(open_count)
    }
}

impl RawMetaStore for DiskMetaStore {
    fn begin_resync_for(
        &self,
        path: &Path,
        is_dir: bool,
    ) -> Result<Box<dyn IncompleteInode + '_>, OpsErr> {
        let abs = self.resolve(path)?;
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).map_err(|err| io_to_ops(parent, err))?;
        }
        match fs::symlink_metadata(&abs) {
            Ok(meta) if meta.is_dir() && !is_dir => {
                fs::remove_dir_all(&abs).map_err(|err| io_to_ops(&abs, err))?;
            }
            Ok(meta) if !meta.is_dir() && is_dir => {
                fs::remove_file(&abs).map_err(|err| io_to_ops(&abs, err))?;
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_to_ops(&abs, err)),
        }
        if is_dir {
            fs::create_dir_all(&abs).map_err(|err| io_to_ops(&abs, err))?;
        } else {
            fs::File::create(&abs).map_err(|err| io_to_ops(&abs, err))?;
        }
        Ok(Box::new(DiskIncompleteInode {
            store: self,
            path: path.to_path_buf(),
            abs,
            is_dir,
            touched: BTreeSet::new(),
        }))
    }

    fn unlink_raw_metadata(&self, path: &Path) -> Result<(), OpsErr> {
        let abs = self.resolve(path)?;
        fs::remove_file(&abs).map_err(|err| io_to_ops(&abs, err))?;
        self.remove_sidecars(path)
    }

    fn remove_raw(&self, path: &Path, is_dir: bool) -> Result<(), OpsErr> {
        let abs = self.resolve(path)?;
        if path.as_os_str().is_empty() {
            return Err(OpsErr::Inval);
        }
        let meta = match fs::symlink_metadata(&abs) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return self.remove_sidecars(path);
            }
            Err(err) => return Err(io_to_ops(&abs, err)),
        };
        if meta.is_dir() != is_dir {
            tracing::debug!(path = %path.display(), is_dir, "removing entry of other kind");
        }
        let removed = if meta.is_dir() {
            fs::remove_dir_all(&abs)
        } else {
            fs::remove_file(&abs)
        };
        match removed {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_to_ops(&abs, err)),
        }
        self.remove_sidecars(path)
    }

    fn link_to_fs_id(&self, path: &Path, fs_id: &str) -> Result<(), OpsErr> {
        let abs = self.resolve(path)?;
        if fs_id.is_empty() || fs_id.contains('/') {
            return Err(OpsErr::Inval);
        }
        let parent = path.parent().unwrap_or(Path::new(""));
        let source = self.root.join(parent).join(FSID_DIR).join(fs_id);
        if let Some(dir) = abs.parent() {
            fs::create_dir_all(dir).map_err(|err| io_to_ops(dir, err))?;
        }
        fs::hard_link(&source, &abs).map_err(|err| io_to_ops(&source, err))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<RawDirEntry>, OpsErr> {
        self.list(path)
    }
}

impl RawMetaSource for DiskMetaStore {
    fn list_dir(&self, path: &Path) -> Result<Vec<RawDirEntry>, OpsErr> {
        self.list(path)
    }

    fn read_entry(&self, path: &Path) -> Result<Option<SourceEntry>, OpsErr> {
        let abs = self.resolve(path)?;
        let meta = match fs::symlink_metadata(&abs) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_to_ops(&abs, err)),
        };
        if meta.is_dir() {
            return Ok(Some(SourceEntry::Directory {
                xattrs: self.load_xattrs(path)?,
            }));
        }
        if let Some(fs_id) = self.fs_id_of(path, &meta)? {
            return Ok(Some(SourceEntry::FsIdLink { fs_id }));
        }
        let content = match fs::read(&abs) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_to_ops(&abs, err)),
        };
        Ok(Some(SourceEntry::Inode {
            content,
            xattrs: self.load_xattrs(path)?,
        }))
    }
}

struct DiskIncompleteInode<'a> {
    store: &'a DiskMetaStore,
    path: PathBuf,
    abs: PathBuf,
    is_dir: bool,
    touched: BTreeSet<String>,
}

impl IncompleteInode for DiskIncompleteInode<'_> {
    fn set_content(&mut self, content: &[u8]) -> Result<(), OpsErr> {
        if self.is_dir {
            return Ok(());
        }
        fs::write(&self.abs, content).map_err(|err| io_to_ops(&self.abs, err))
    }

    fn set_xattr(&mut self, name: &str, value: &[u8]) -> Result<(), OpsErr> {
        let mut xattrs = self.store.load_xattrs(&self.path)?;
        xattrs.insert(name.to_string(), value.to_vec());
        self.store.save_xattrs(&self.path, &xattrs)?;
        self.touched.insert(name.to_string());
        Ok(())
    }

    fn clear_unset_xattrs(&mut self) -> Result<(), OpsErr> {
        let mut xattrs = self.store.load_xattrs(&self.path)?;
        let before = xattrs.len();
        xattrs.retain(|name, _| self.touched.contains(name));
        if xattrs.len() == before {
            return Ok(());
        }
        self.store.save_xattrs(&self.path, &xattrs)
    }
}

fn io_to_ops(path: &Path, err: io::Error) -> OpsErr {
    match err.kind() {
        io::ErrorKind::NotFound => OpsErr::PathNotExists,
        io::ErrorKind::AlreadyExists => OpsErr::Exists,
        _ => {
            tracing::warn!(path = %path.display(), error = %err, "raw metadata io failed");
            OpsErr::Internal
        }
    }
}

fn encode_xattrs(xattrs: &XAttrMap) -> Result<Vec<u8>, String> {
    let mut buf = Vec::new();
    let mut enc = encoder(&mut buf);
    enc.map(xattrs.len() as u64).map_err(|err| err.to_string())?;
    for (name, value) in xattrs {
        enc.str(name).map_err(|err| err.to_string())?;
        enc.bytes(value).map_err(|err| err.to_string())?;
    }
    Ok(buf)
}

fn decode_xattrs(bytes: &[u8], limits: &DecodeLimits) -> Result<XAttrMap, String> {
    let limits = DecodeLimits {
        max_map_entries: usize::MAX,
        ..*limits
    };
    let mut dec = Decoder::new(bytes);
    let len = decode_map_len(&mut dec, &limits).map_err(|err| err.to_string())?;
    let mut out = XAttrMap::new();
    for _ in 0..len {
        let name = decode_text(&mut dec, &limits).map_err(|err| err.to_string())?;
        let value = decode_bytes(&mut dec, &limits, "value").map_err(|err| err.to_string())?;
        out.insert(name.to_string(), value.to_vec());
    }
    ensure_consumed(&dec, bytes).map_err(|err| err.to_string())?;
    Ok(out)
}

fn encode_inode(open_count: u32) -> Result<Vec<u8>, String> {
    let mut buf = Vec::new();
    let mut enc = encoder(&mut buf);
    enc.map(1).map_err(|err| err.to_string())?;
    enc.str("open_count").map_err(|err| err.to_string())?;
    enc.u32(open_count).map_err(|err| err.to_string())?;
    Ok(buf)
}

fn decode_inode(bytes: &[u8], limits: &DecodeLimits) -> Result<u32, String> {
    let mut dec = Decoder::new(bytes);
    let len = decode_map_len(&mut dec, limits).map_err(|err| err.to_string())?;
    let mut open_count = None;
    for _ in 0..len {
        match decode_text(&mut dec, limits).map_err(|err| err.to_string())? {
            "open_count" => {
                let value = decode_u32(&mut dec, "open_count").map_err(|err| err.to_string())?;
                open_count = Some(value);
            }
            other => return Err(format!("unknown inode field {other:?}")),
        }
    }
    ensure_consumed(&dec, bytes).map_err(|err| err.to_string())?;
    open_count.ok_or_else(|| "missing open_count".to_string())
}

fn write_creating_parent(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, data)
}

fn atomic_write(dir: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
