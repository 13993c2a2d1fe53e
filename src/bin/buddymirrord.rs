use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser};

use buddymirror::config::{self, Config};
use buddymirror::consistency::{BuddyCommFile, TargetStateStore};
use buddymirror::core::{BuddyGroupMapper, TargetId};
use buddymirror::lockstore::EntryLockStore;
use buddymirror::mirror::{
    MetaRequestHandler, MirrorExecutor, MirrorExecutorConfig, MirrorServer, MirrorServerConfig,
    TargetRoutes, TcpMessenger, TcpMessengerConfig,
};
use buddymirror::resync::{
    DiskMetaStore, ModificationLog, ResyncError, ResyncServer, ResyncServerConfig,
};
use buddymirror::telemetry;
use buddymirror::transport::{DecodeLimits, ListenerConfig, ListenerHandle};

#[derive(Parser, Debug)]
#[command(
    name = "buddymirrord",
    version,
    about = "Receives buddy resync streams and forwarded operations for a metadata target"
)]
struct Cli {
    /// Config file; falls back to $BM_CONFIG.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Metadata root; mirrored entries live in its buddy mirror subdirectory.
    #[arg(long, value_name = "DIR")]
    meta_root: PathBuf,

    /// Also accept forwarded mirror operations on this address.
    #[arg(long, value_name = "ADDR", requires = "target")]
    mirror_listen: Option<String>,

    /// Target id served as secondary; required with --mirror-listen.
    #[arg(long, value_name = "ID")]
    target: Option<u16>,

    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let cfg = match config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("config load failed: {err}");
            std::process::exit(2);
        }
    };
    let mut logging = cfg.logging.clone();
    telemetry::apply_daemon_logging_defaults(&mut logging);
    let _telemetry_guard = telemetry::init(telemetry::TelemetryConfig::new(cli.verbose, logging));

    if let Err(err) = run(&cli, &cfg) {
        tracing::error!("buddymirrord failed: {err}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli, cfg: &Config) -> buddymirror::Result<()> {
    let mirror_root = cfg.mirror.root_under(&cli.meta_root);
    let store = Arc::new(DiskMetaStore::open(&mirror_root).map_err(ResyncError::from)?);
    let server = ResyncServer::start(
        ResyncServerConfig {
            listener: ListenerConfig {
                name: "resync",
                listen_addr: cfg.net.listen_addr.clone(),
                max_connections: cfg.net.max_connections(),
                io_timeout: Some(cfg.mirror.forward_timeout()),
            },
            max_frame_bytes: cfg.resync.max_packet_bytes,
            store_client_xattrs: cfg.mirror.store_client_xattrs,
            limits: DecodeLimits::default(),
        },
        store.clone(),
    )?;
    tracing::info!(
        addr = %server.local_addr(),
        root = %mirror_root.display(),
        "resync receiver listening"
    );
    let mirror = match (&cli.mirror_listen, cli.target) {
        (Some(addr), Some(target)) => Some(start_mirror_server(
            cli,
            cfg,
            addr,
            TargetId::new(target),
            store,
        )?),
        _ => None,
    };

    // Runs until the supervisor closes stdin.
    let mut sink = [0u8; 256];
    let mut stdin = io::stdin().lock();
    loop {
        match stdin.read(&mut sink) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::warn!("stdin read failed, shutting down: {err}");
                break;
            }
        }
    }

    tracing::info!("shutting down");
    if let Some(mirror) = mirror {
        mirror.shutdown();
    }
    server.shutdown();
    Ok(())
}

/// Serves forwarded operations as the secondary of `target`. This node
/// belongs to no local group, so it never forwards on its own.
fn start_mirror_server(
    cli: &Cli,
    cfg: &Config,
    addr: &str,
    target: TargetId,
    store: Arc<DiskMetaStore>,
) -> buddymirror::Result<ListenerHandle> {
    let executor = Arc::new(MirrorExecutor::new(MirrorExecutorConfig {
        local_target: target,
        groups: Arc::new(BuddyGroupMapper::new()),
        states: Arc::new(TargetStateStore::new()),
        buddy_comm: Arc::new(BuddyCommFile::new(&cli.meta_root)),
        locks: Arc::new(EntryLockStore::new(cfg.lock_table_config())),
        messenger: Arc::new(TcpMessenger::new(TcpMessengerConfig {
            nodes: cfg.net.node_addrs(),
            timeout: cfg.mirror.forward_timeout(),
            max_frame_bytes: cfg.resync.max_packet_bytes,
            limits: DecodeLimits::default(),
        })),
        meta: store,
        routes: Arc::new(TargetRoutes::new()),
        modifications: Arc::new(ModificationLog::new()),
    }));
    let server = MirrorServer::start(
        MirrorServerConfig {
            listener: ListenerConfig {
                name: "mirror",
                listen_addr: addr.to_string(),
                max_connections: cfg.net.max_connections(),
                io_timeout: Some(cfg.mirror.forward_timeout()),
            },
            max_frame_bytes: cfg.resync.max_packet_bytes,
            limits: DecodeLimits::default(),
        },
        MetaRequestHandler::new(executor),
    )?;
    tracing::info!(addr = %server.local_addr(), target_id = %target, "mirror receiver listening");
    Ok(server)
}
