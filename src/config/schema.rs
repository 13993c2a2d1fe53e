use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{NodeId, TargetId};
use crate::lockstore::LockTableConfig;
use crate::resync::ResyncJobConfig;
use crate::transport::DEFAULT_MAX_FRAME_BYTES;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mirror: MirrorConfig,
    pub resync: ResyncConfig,
    pub lock_store: LockStoreConfig,
    pub net: NetConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn lock_table_config(&self) -> LockTableConfig {
        LockTableConfig {
            num_buckets: self.lock_store.num_buckets.max(1),
            free_list_capacity: self.lock_store.free_list_capacity,
        }
    }

    /// Job parameters for resyncing `target_id` onto `buddy_target_id`,
    /// rooted at the target's mirror directory under `meta_root`.
    pub fn resync_job_config(
        &self,
        target_id: TargetId,
        buddy_target_id: TargetId,
        meta_root: &Path,
    ) -> ResyncJobConfig {
        ResyncJobConfig {
            target_id,
            buddy_target_id,
            root: self.mirror.root_under(meta_root),
            safety_threshold_secs: self.resync.safety_threshold_mins.saturating_mul(60),
            max_open_fds: self.resync.max_open_fds,
            num_gather_slaves: self.resync.num_gather_slaves,
            num_sync_slaves: self.resync.num_sync_slaves,
            gather_queue_capacity: self.resync.gather_queue_capacity,
            walk_depth: self.resync.walk_depth,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Directory below the metadata root holding mirrored entries.
    pub buddy_mirror_subdir: String,
    pub store_client_xattrs: bool,
    pub forward_timeout_ms: u64,
}

impl MirrorConfig {
    pub fn root_under(&self, meta_root: &Path) -> PathBuf {
        meta_root.join(&self.buddy_mirror_subdir)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            buddy_mirror_subdir: "buddymir".to_string(),
            store_client_xattrs: true,
            forward_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResyncConfig {
    pub safety_threshold_mins: u64,
    pub max_open_fds: usize,
    pub num_gather_slaves: usize,
    pub num_sync_slaves: usize,
    pub gather_queue_capacity: usize,
    pub walk_depth: usize,
    pub max_packet_bytes: usize,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            safety_threshold_mins: 10,
            max_open_fds: 20,
            num_gather_slaves: 6,
            num_sync_slaves: 12,
            gather_queue_capacity: 5000,
            walk_depth: 2,
            max_packet_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockStoreConfig {
    pub num_buckets: usize,
    pub free_list_capacity: usize,
}

impl Default for LockStoreConfig {
    fn default() -> Self {
        let defaults = LockTableConfig::default();
        Self {
            num_buckets: defaults.num_buckets,
            free_list_capacity: defaults.free_list_capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub listen_addr: String,
    pub max_connections: Option<usize>,
    pub nodes: Vec<NodeAddrConfig>,
}

impl NetConfig {
    pub fn max_connections(&self) -> NonZeroUsize {
        self.max_connections
            .and_then(NonZeroUsize::new)
            .unwrap_or(NonZeroUsize::MIN)
    }

    /// Node addresses keyed by id; later entries win on duplicates.
    pub fn node_addrs(&self) -> BTreeMap<NodeId, String> {
        self.nodes
            .iter()
            .map(|node| (node.node_id, node.addr.clone()))
            .collect()
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8005".to_string(),
            max_connections: Some(32),
            nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddrConfig {
    pub node_id: NodeId,
    pub addr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
    pub retention_max_files: Option<usize>,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
            retention_max_files: Some(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MirrorConfigOverride {
    pub buddy_mirror_subdir: Option<String>,
    pub store_client_xattrs: Option<bool>,
    pub forward_timeout_ms: Option<u64>,
}

impl MirrorConfigOverride {
    pub fn apply_to(&self, target: &mut MirrorConfig) {
        if let Some(subdir) = self.buddy_mirror_subdir.as_ref() {
            target.buddy_mirror_subdir = subdir.clone();
        }
        if let Some(value) = self.store_client_xattrs {
            target.store_client_xattrs = value;
        }
        if let Some(value) = self.forward_timeout_ms {
            target.forward_timeout_ms = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResyncConfigOverride {
    pub safety_threshold_mins: Option<u64>,
    pub max_open_fds: Option<usize>,
    pub num_gather_slaves: Option<usize>,
    pub num_sync_slaves: Option<usize>,
    pub gather_queue_capacity: Option<usize>,
    pub walk_depth: Option<usize>,
    pub max_packet_bytes: Option<usize>,
}

impl ResyncConfigOverride {
    pub fn apply_to(&self, target: &mut ResyncConfig) {
        if let Some(value) = self.safety_threshold_mins {
            target.safety_threshold_mins = value;
        }
        if let Some(value) = self.max_open_fds {
            target.max_open_fds = value;
        }
        if let Some(value) = self.num_gather_slaves {
            target.num_gather_slaves = value;
        }
        if let Some(value) = self.num_sync_slaves {
            target.num_sync_slaves = value;
        }
        if let Some(value) = self.gather_queue_capacity {
            target.gather_queue_capacity = value;
        }
        if let Some(value) = self.walk_depth {
            target.walk_depth = value;
        }
        if let Some(value) = self.max_packet_bytes {
            target.max_packet_bytes = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LockStoreConfigOverride {
    pub num_buckets: Option<usize>,
    pub free_list_capacity: Option<usize>,
}

impl LockStoreConfigOverride {
    pub fn apply_to(&self, target: &mut LockStoreConfig) {
        if let Some(value) = self.num_buckets {
            target.num_buckets = value;
        }
        if let Some(value) = self.free_list_capacity {
            target.free_list_capacity = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetConfigOverride {
    pub listen_addr: Option<String>,
    pub max_connections: Option<usize>,
    pub nodes: Option<Vec<NodeAddrConfig>>,
}

impl NetConfigOverride {
    pub fn apply_to(&self, target: &mut NetConfig) {
        if let Some(addr) = self.listen_addr.as_ref() {
            target.listen_addr = addr.clone();
        }
        if let Some(value) = self.max_connections {
            target.max_connections = Some(value);
        }
        if let Some(nodes) = self.nodes.as_ref() {
            target.nodes = nodes.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfigOverride {
    pub stdout: Option<bool>,
    pub stdout_format: Option<LogFormat>,
    pub filter: Option<String>,
    pub file: Option<FileLoggingConfigOverride>,
}

impl LoggingConfigOverride {
    pub fn apply_to(&self, target: &mut LoggingConfig) {
        if let Some(stdout) = self.stdout {
            target.stdout = stdout;
        }
        if let Some(format) = self.stdout_format {
            target.stdout_format = format;
        }
        if let Some(filter) = self.filter.as_ref() {
            target.filter = Some(filter.clone());
        }
        if let Some(file) = self.file.as_ref() {
            file.apply_to(&mut target.file);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileLoggingConfigOverride {
    pub enabled: Option<bool>,
    pub dir: Option<PathBuf>,
    pub format: Option<LogFormat>,
    pub rotation: Option<LogRotation>,
    pub retention_max_files: Option<usize>,
}

impl FileLoggingConfigOverride {
    pub fn apply_to(&self, target: &mut FileLoggingConfig) {
        if let Some(enabled) = self.enabled {
            target.enabled = enabled;
        }
        if let Some(dir) = self.dir.as_ref() {
            target.dir = Some(dir.clone());
        }
        if let Some(format) = self.format {
            target.format = format;
        }
        if let Some(rotation) = self.rotation {
            target.rotation = rotation;
        }
        if let Some(files) = self.retention_max_files {
            target.retention_max_files = Some(files);
        }
    }
}

/// A partially specified config file. Absent keys leave the layer below
/// untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigLayer {
    pub mirror: MirrorConfigOverride,
    pub resync: ResyncConfigOverride,
    pub lock_store: LockStoreConfigOverride,
    pub net: NetConfigOverride,
    pub logging: LoggingConfigOverride,
}

impl ConfigLayer {
    pub fn apply_to(&self, base: &mut Config) {
        self.mirror.apply_to(&mut base.mirror);
        self.resync.apply_to(&mut base.resync);
        self.lock_store.apply_to(&mut base.lock_store);
        self.net.apply_to(&mut base.net);
        self.logging.apply_to(&mut base.logging);
    }
}
