use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{FileLoggingConfig, LogFormat, LogRotation, LoggingConfig};

const LOG_FILE_PREFIX: &str = "buddymirror.log";
const DEFAULT_LOG_DIR: &str = "/var/log/buddymirror";
const LOG_FILTER_ENV: &str = "BM_LOG";

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub verbosity: u8,
    pub logging: LoggingConfig,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8, logging: LoggingConfig) -> Self {
        Self { verbosity, logging }
    }
}

pub fn is_test_env() -> bool {
    std::env::var_os("BM_TESTING").is_some() || std::env::var_os("RUST_TEST_THREADS").is_some()
}

/// The daemon logs to file unless running under tests.
pub fn apply_daemon_logging_defaults(logging: &mut LoggingConfig) {
    apply_daemon_logging_defaults_inner(logging, is_test_env());
}

fn apply_daemon_logging_defaults_inner(logging: &mut LoggingConfig, is_test_env: bool) {
    if is_test_env {
        return;
    }
    logging.file.enabled = true;
}

/// Keeps the non-blocking file writers flushing; drop on shutdown.
pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let default_directive = match config.logging.filter.as_deref() {
        Some(filter) => filter.to_string(),
        None => level_from_verbosity(config.verbosity).to_string(),
    };
    let filter = EnvFilter::builder()
        .with_env_var(LOG_FILTER_ENV)
        .try_from_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.logging.stdout {
        layers.push(build_stdout_layer(config.logging.stdout_format));
    }

    let mut pruned = None;
    let mut file_setup_error = None;
    if config.logging.file.enabled {
        let dir = resolve_log_dir(&config.logging.file);
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                if let Some(max_files) = config.logging.file.retention_max_files {
                    match prune_logs(&dir, LOG_FILE_PREFIX, max_files) {
                        Ok(removed) => pruned = Some(removed),
                        Err(err) => {
                            file_setup_error = Some(format!("log retention failed: {err}"));
                        }
                    }
                }
                let (layer, guard) = build_file_layer(&config.logging.file, &dir);
                layers.push(layer);
                guards.push(guard);
            }
            Err(err) => {
                file_setup_error =
                    Some(format!("log dir init failed for {}: {err}", dir.display()));
            }
        }
    }

    layers.push(Box::new(filter));

    // A second init (e.g. from several tests) keeps the first subscriber.
    let _ = Registry::default().with(layers).try_init();

    if let Some(removed) = pruned
        && removed > 0
    {
        tracing::info!(pruned = removed, "log retention applied");
    }
    if let Some(error) = file_setup_error {
        tracing::warn!("{error}");
    }

    TelemetryGuard { _guards: guards }
}

fn build_stdout_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Tree => Box::new(tracing_tree::HierarchicalLayer::new(2)),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true)
                .with_current_span(true),
        ),
    }
}

fn build_file_layer(
    config: &FileLoggingConfig,
    dir: &Path,
) -> (
    Box<dyn Layer<Registry> + Send + Sync>,
    tracing_appender::non_blocking::WorkerGuard,
) {
    let rotation = match config.rotation {
        LogRotation::Daily => tracing_appender::rolling::Rotation::DAILY,
        LogRotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
        LogRotation::Never => tracing_appender::rolling::Rotation::NEVER,
    };
    let appender =
        tracing_appender::rolling::RollingFileAppender::new(rotation, dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Tree => Box::new(
            tracing_tree::HierarchicalLayer::new(2)
                .with_ansi(false)
                .with_writer(writer),
        ),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_thread_names(true)
                .with_current_span(true),
        ),
    };
    (layer, guard)
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::WARN,
        1 => tracing::metadata::LevelFilter::INFO,
        2 => tracing::metadata::LevelFilter::DEBUG,
        _ => tracing::metadata::LevelFilter::TRACE,
    }
}

fn resolve_log_dir(config: &FileLoggingConfig) -> PathBuf {
    config
        .dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
}

/// Removes the oldest rotated logs beyond `max_files`; returns how many
/// were removed.
fn prune_logs(dir: &Path, prefix: &str, max_files: usize) -> std::io::Result<usize> {
    let mut entries = collect_log_entries(dir, prefix)?;
    let excess = select_excess(&mut entries, max_files);
    let mut removed = 0;
    for path in excess {
        if fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

fn collect_log_entries(dir: &Path, prefix: &str) -> std::io::Result<Vec<(SystemTime, PathBuf)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((modified, path));
    }
    Ok(entries)
}

fn select_excess(entries: &mut Vec<(SystemTime, PathBuf)>, max_files: usize) -> Vec<PathBuf> {
    entries.sort();
    if entries.len() <= max_files {
        return Vec::new();
    }
    let excess = entries.len() - max_files;
    entries.drain(..excess).map(|(_, path)| path).collect()
}
