//! Config loading and persistence.

mod load;
mod merge;
mod schema;

pub use load::{
    ConfigError, config_path, load, load_from, load_layer, load_or_default, system_config_path,
    write_config,
};
pub use merge::{apply_env_overrides, apply_env_overrides_from, merge_layers};
pub use schema::{
    CleanerConfig, CleanerConfigOverride, Config, ConfigLayer, ExportConfig, ExportConfigOverride,
    FileLoggingConfig, FileLoggingConfigOverride, LogFormat, LogRotation, LoggingConfig,
    LoggingConfigOverride, MirrorConfig, MirrorConfigOverride, StorageConfig,
    StorageConfigOverride,
};
