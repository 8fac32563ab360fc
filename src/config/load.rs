use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::merge::{apply_env_overrides, merge_layers};
use super::{Config, ConfigLayer};
use crate::error::{Effect, Transience};

const SYSTEM_CONFIG_PATH: &str = "/etc/bmr/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn transience(&self) -> Transience {
        match self {
            ConfigError::Read { .. } | ConfigError::Write { .. } => Transience::Retryable,
            ConfigError::Parse { .. } | ConfigError::Render(_) => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            ConfigError::Write { .. } => Effect::Unknown,
            _ => Effect::None,
        }
    }
}

/// System-wide layer; `BMR_SYSTEM_CONFIG` relocates it.
pub fn system_config_path() -> PathBuf {
    std::env::var_os("BMR_SYSTEM_CONFIG")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG_PATH))
}

/// Per-user layer, applied after the system layer.
pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("config.toml")
}

pub fn load_layer(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

pub fn load() -> Result<Config, ConfigError> {
    load_from(&system_config_path(), &config_path())
}

pub fn load_from(system: &Path, user: &Path) -> Result<Config, ConfigError> {
    let system = load_layer(system)?;
    let user = load_layer(user)?;
    let mut config = merge_layers(system, user);
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load, falling back to defaults (plus env overrides) when a layer is unreadable.
pub fn load_or_default() -> Config {
    match load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("config load failed, using defaults: {e}");
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    let contents = toml::to_string_pretty(cfg)?;
    crate::paths::atomic_write(path, contents.as_bytes()).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::{LogFormat, LogRotation};

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let mut cfg = Config::default();
        cfg.logging.stdout = false;
        cfg.logging.file.enabled = true;
        cfg.logging.file.rotation = LogRotation::Hourly;
        cfg.storage.pool = "tank".into();
        cfg.mirror.rate_limit_bytes_per_sec = Some(50 * 1024 * 1024);
        cfg.cleaner.grace_period_secs = 60;

        write_config(&path, &cfg).expect("write config");
        let loaded = load_layer(&path).expect("load").expect("present");
        let mut merged = Config::default();
        loaded.apply_to(&mut merged);

        assert!(!merged.logging.stdout);
        assert!(merged.logging.file.enabled);
        assert!(matches!(merged.logging.file.rotation, LogRotation::Hourly));
        assert!(matches!(merged.logging.stdout_format, LogFormat::Compact));
        assert_eq!(merged.storage.pool, "tank");
        assert_eq!(merged.mirror.rate_limit_bytes_per_sec, Some(50 * 1024 * 1024));
        assert_eq!(merged.cleaner.grace_period_secs, 60);
    }

    #[test]
    fn missing_layer_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load_layer(&dir.path().join("absent.toml")).unwrap().is_none());
    }

    #[test]
    fn malformed_layer_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.toml");
        fs::write(&path, "mirror = 3").unwrap();
        let err = load_layer(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn defaults_match_appliance_layout() {
        let cfg = Config::default();
        assert_eq!(cfg.storage.pool, "homePool");
        assert_eq!(cfg.cleaner.grace_period_secs, 86_400);
        assert_eq!(cfg.mirror.start_poll_attempts, 10);
        assert!(cfg.mirror.rate_limit_bytes_per_sec.is_none());
    }
}
