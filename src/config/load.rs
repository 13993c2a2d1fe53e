use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::merge::{apply_env_overrides, merge_layers};
use super::{Config, ConfigLayer};

pub const CONFIG_ENV: &str = "BM_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The config file to load: an explicit path wins over `BM_CONFIG`.
pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit.map(Path::to_path_buf).or_else(|| {
        std::env::var_os(CONFIG_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    })
}

pub fn load_layer(path: &Path) -> Result<ConfigLayer, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Defaults, then the config file if one is named, then env overrides.
/// A named file that cannot be read is an error.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let layers = match config_path(explicit) {
        Some(path) => vec![load_layer(&path)?],
        None => Vec::new(),
    };
    let mut config = merge_layers(layers);
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(write_err)?;
    let contents = toml::to_string_pretty(cfg)?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    fs::write(temp.path(), contents.as_bytes()).map_err(write_err)?;
    temp.persist(path).map_err(|err| write_err(err.error))?;
    Ok(())
}
