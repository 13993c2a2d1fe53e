use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use buddymirror::resync::{DiskMetaStore, ResyncSenderConfig, ResyncServer, ResyncServerConfig};
use buddymirror::test_harness::ChunkTree;
use buddymirror::transport::{DecodeLimits, ListenerConfig, ListenerHandle};

const MAX_FRAME_BYTES: usize = 1 << 20;

/// A primary mirror tree and a secondary tree served by a resync receiver
/// on a loopback port.
pub struct ResyncRig {
    primary_dir: tempfile::TempDir,
    secondary_dir: tempfile::TempDir,
    pub primary: Arc<DiskMetaStore>,
    pub secondary: Arc<DiskMetaStore>,
    server: Option<ListenerHandle>,
}

impl ResyncRig {
    pub fn start() -> Self {
        let primary_dir = tempfile::tempdir().expect("tempdir");
        let secondary_dir = tempfile::tempdir().expect("tempdir");
        let primary = Arc::new(DiskMetaStore::open(primary_dir.path()).expect("primary store"));
        let secondary =
            Arc::new(DiskMetaStore::open(secondary_dir.path()).expect("secondary store"));
        let server = ResyncServer::start(
            ResyncServerConfig {
                listener: ListenerConfig {
                    name: "resync-rig",
                    listen_addr: "127.0.0.1:0".to_string(),
                    max_connections: NonZeroUsize::new(16).expect("non-zero"),
                    io_timeout: Some(Duration::from_secs(10)),
                },
                max_frame_bytes: MAX_FRAME_BYTES,
                store_client_xattrs: true,
                limits: DecodeLimits::default(),
            },
            secondary.clone(),
        )
        .expect("start resync server");
        Self {
            primary_dir,
            secondary_dir,
            primary,
            secondary,
            server: Some(server),
        }
    }

    pub fn primary_tree(&self) -> ChunkTree {
        ChunkTree::new(self.primary_dir.path())
    }

    pub fn secondary_tree(&self) -> ChunkTree {
        ChunkTree::new(self.secondary_dir.path())
    }

    pub fn primary_root(&self) -> &Path {
        self.primary_dir.path()
    }

    pub fn sender_config(&self, sync_xattrs: bool) -> ResyncSenderConfig {
        let addr = self
            .server
            .as_ref()
            .map(|server| server.local_addr().to_string())
            .expect("server running");
        ResyncSenderConfig {
            addr,
            timeout: Duration::from_secs(10),
            max_frame_bytes: MAX_FRAME_BYTES,
            sync_xattrs,
        }
    }
}

impl Drop for ResyncRig {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
    }
}
