//! Config loading and persistence.

mod load;
mod merge;
mod schema;

pub use load::{CONFIG_ENV, ConfigError, config_path, load, load_layer, write_config};
pub use merge::{apply_env_overrides, apply_env_overrides_from, merge_layers};
pub use schema::{
    Config, ConfigLayer, FileLoggingConfig, FileLoggingConfigOverride, LockStoreConfig,
    LockStoreConfigOverride, LogFormat, LogRotation, LoggingConfig, LoggingConfigOverride,
    MirrorConfig, MirrorConfigOverride, NetConfig, NetConfigOverride, NodeAddrConfig,
    ResyncConfig, ResyncConfigOverride,
};
