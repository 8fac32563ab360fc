use super::{Config, ConfigLayer};

pub fn merge_layers(system: Option<ConfigLayer>, user: Option<ConfigLayer>) -> Config {
    let mut config = Config::default();
    if let Some(layer) = system {
        layer.apply_to(&mut config);
    }
    if let Some(layer) = user {
        layer.apply_to(&mut config);
    }
    config
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_env_overrides_from(config, |key| std::env::var(key).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup.
pub fn apply_env_overrides_from<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    if let Some(filter) = get("BMR_LOG_FILTER") {
        config.logging.filter = Some(filter);
    }

    if let Some(pool) = get("BMR_POOL") {
        config.storage.pool = pool;
    }

    if let Some(raw) = get("BMR_MIRROR_RATE_LIMIT") {
        match raw.parse::<u64>() {
            Ok(0) => config.mirror.rate_limit_bytes_per_sec = None,
            Ok(value) => config.mirror.rate_limit_bytes_per_sec = Some(value),
            Err(err) => tracing::warn!("invalid BMR_MIRROR_RATE_LIMIT, ignoring: {err}"),
        }
    }

    if let Some(raw) = get("BMR_CLEANER_GRACE_SECS") {
        match raw.parse::<u64>() {
            Ok(value) => config.cleaner.grace_period_secs = value,
            Err(err) => tracing::warn!("invalid BMR_CLEANER_GRACE_SECS, ignoring: {err}"),
        }
    }
}
