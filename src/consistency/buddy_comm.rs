//! Durable per-target buddy communication record.
//!
//! Two small files live in the target's root directory:
//! `.buddyneedsresync` holds resync flags, `lastbuddycomm` holds the time of
//! the last successful forward to the buddy in seconds since the epoch. An
//! operator-supplied `lastbuddycomm.override` takes precedence when present.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use thiserror::Error;

pub const NEEDS_RESYNC_FILE: &str = ".buddyneedsresync";
pub const LAST_BUDDY_COMM_FILE: &str = "lastbuddycomm";
pub const LAST_BUDDY_COMM_OVERRIDE_FILE: &str = "lastbuddycomm.override";

/// Change not yet acknowledged by the state store.
pub const FLAG_UNACKED: u8 = 1;
/// Buddy needs a resync.
pub const FLAG_REQUIRED: u8 = 2;

#[derive(Debug, Error)]
pub enum BuddyCommError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed contents in {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LastBuddyComm {
    /// Seconds since the epoch; zero when never recorded.
    pub at: u64,
    pub is_override: bool,
}

pub struct BuddyCommFile {
    dir: PathBuf,
    // serializes read-modify-write of the flag file
    flags_lock: Mutex<()>,
}

impl BuddyCommFile {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            flags_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn flags(&self) -> Result<u8, BuddyCommError> {
        let path = self.dir.join(NEEDS_RESYNC_FILE);
        match read_trimmed(&path)? {
            None => Ok(0),
            Some(raw) => raw.parse::<u8>().map_err(|err| BuddyCommError::Malformed {
                path,
                reason: err.to_string(),
            }),
        }
    }

    pub fn needs_resync(&self) -> Result<bool, BuddyCommError> {
        Ok(self.flags()? & FLAG_REQUIRED != 0)
    }

    pub fn is_unacked(&self) -> Result<bool, BuddyCommError> {
        Ok(self.flags()? & FLAG_UNACKED != 0)
    }

    /// Record whether the buddy needs a resync. Returns `true` when the
    /// stored flag changed; an unchanged required bit is not rewritten.
    pub fn set_needs_resync(&self, needs_resync: bool) -> Result<bool, BuddyCommError> {
        let _guard = self.flags_lock.lock();
        let current = self.flags()?;
        if (current & FLAG_REQUIRED != 0) == needs_resync {
            return Ok(false);
        }
        let next = if needs_resync {
            FLAG_REQUIRED | FLAG_UNACKED
        } else {
            FLAG_UNACKED
        };
        self.write_file(NEEDS_RESYNC_FILE, &next.to_string())?;
        tracing::debug!(dir = %self.dir.display(), needs_resync, "buddy resync flag persisted");
        Ok(true)
    }

    /// The state store has taken note of the last change.
    pub fn ack(&self) -> Result<(), BuddyCommError> {
        let _guard = self.flags_lock.lock();
        let current = self.flags()?;
        if current & FLAG_UNACKED == 0 {
            return Ok(());
        }
        self.write_file(NEEDS_RESYNC_FILE, &(current & !FLAG_UNACKED).to_string())
    }

    pub fn last_buddy_comm(&self) -> Result<LastBuddyComm, BuddyCommError> {
        let override_path = self.dir.join(LAST_BUDDY_COMM_OVERRIDE_FILE);
        if let Some(raw) = read_trimmed(&override_path)? {
            return Ok(LastBuddyComm {
                at: parse_secs(&override_path, &raw)?,
                is_override: true,
            });
        }
        let path = self.dir.join(LAST_BUDDY_COMM_FILE);
        let at = match read_trimmed(&path)? {
            Some(raw) => parse_secs(&path, &raw)?,
            None => 0,
        };
        Ok(LastBuddyComm {
            at,
            is_override: false,
        })
    }

    /// Record a successful exchange with the buddy.
    pub fn touch(&self) -> Result<(), BuddyCommError> {
        self.set_last_buddy_comm(now_secs(), false)
    }

    /// Write the timestamp. An override is stored beside the regular record,
    /// which is left untouched and becomes visible again on `clear_override`.
    pub fn set_last_buddy_comm(&self, at: u64, is_override: bool) -> Result<(), BuddyCommError> {
        if is_override {
            self.write_file(LAST_BUDDY_COMM_OVERRIDE_FILE, &at.to_string())
        } else {
            self.write_file(LAST_BUDDY_COMM_FILE, &at.to_string())
        }
    }

    pub fn clear_override(&self) -> Result<(), BuddyCommError> {
        let path = self.dir.join(LAST_BUDDY_COMM_OVERRIDE_FILE);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BuddyCommError::Write { path, source }),
        }
    }

    fn write_file(&self, name: &str, contents: &str) -> Result<(), BuddyCommError> {
        let path = self.dir.join(name);
        atomic_write(&self.dir, &path, contents.as_bytes())
            .map_err(|source| BuddyCommError::Write { path, source })
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn read_trimmed(path: &Path) -> Result<Option<String>, BuddyCommError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw.trim().to_string())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(BuddyCommError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn parse_secs(path: &Path, raw: &str) -> Result<u64, BuddyCommError> {
    raw.parse::<u64>().map_err(|err| BuddyCommError::Malformed {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

fn atomic_write(dir: &Path, path: &Path, data: &[u8]) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
