//! Process-wide `tracing` subscriber: filtered stderr output plus an optional
//! rolling log file under the state root.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::metadata::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{FileLoggingConfig, LogFormat, LogRotation, LoggingConfig};
use crate::paths::StateDir;

const LOG_FILE_PREFIX: &str = "bmr.log";
const FILTER_ENV: &str = "BMR_LOG";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Flushes the file writer when dropped.
pub struct TelemetryGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber. A second call keeps the first subscriber
/// but still prepares the log directory.
pub fn init(logging: &LoggingConfig, state_dir: &StateDir) -> TelemetryGuard {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    if logging.stdout {
        layers.push(format_layer(logging.stdout_format, io::stderr, true));
    }

    let mut file_guard = None;
    let mut pruned = 0;
    let mut file_error = None;
    if logging.file.enabled {
        let dir = log_dir(&logging.file, state_dir);
        match prepare_log_dir(&dir, &logging.file) {
            Ok(removed) => {
                let appender =
                    RollingFileAppender::new(rotation(logging.file.rotation), &dir, LOG_FILE_PREFIX);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                layers.push(format_layer(logging.file.format, writer, false));
                file_guard = Some(guard);
                pruned = removed;
            }
            Err(err) => file_error = Some(format!("{}: {err}", dir.display())),
        }
    }
    layers.push(Box::new(filter(logging)));

    let _ = Registry::default().with(layers).try_init();

    if pruned > 0 {
        tracing::info!(pruned, "old log files removed");
    }
    if let Some(error) = file_error {
        tracing::warn!(%error, "file logging disabled");
    }
    TelemetryGuard { _file: file_guard }
}

pub fn log_dir(config: &FileLoggingConfig, state_dir: &StateDir) -> PathBuf {
    config.dir.clone().unwrap_or_else(|| state_dir.log_dir())
}

fn filter(logging: &LoggingConfig) -> EnvFilter {
    let builder = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(FILTER_ENV);
    match logging.filter.as_deref() {
        Some(directives) => builder.parse(directives).unwrap_or_else(|err| {
            eprintln!("invalid logging.filter `{directives}` ({err}), using {FILTER_ENV}");
            builder.from_env_lossy()
        }),
        None => builder.from_env_lossy(),
    }
}

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Tree => Box::new(
            tracing_tree::HierarchicalLayer::new(2)
                .with_ansi(ansi)
                .with_writer(writer),
        ),
        LogFormat::Pretty => Box::new(
            fmt::layer()
                .pretty()
                .with_ansi(ansi)
                .with_writer(writer)
                .with_thread_names(true),
        ),
        LogFormat::Compact => Box::new(
            fmt::layer()
                .compact()
                .with_ansi(ansi)
                .with_writer(writer)
                .with_target(true),
        ),
        LogFormat::Json => Box::new(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(true)
                .with_span_list(true),
        ),
    }
}

fn rotation(rotation: LogRotation) -> Rotation {
    match rotation {
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Minutely => Rotation::MINUTELY,
        LogRotation::Never => Rotation::NEVER,
    }
}

fn prepare_log_dir(dir: &Path, config: &FileLoggingConfig) -> io::Result<usize> {
    fs::create_dir_all(dir)?;
    prune_logs(dir, config, SystemTime::now())
}

/// Remove rolled files older than the configured age, then the oldest ones
/// beyond the configured count. Returns how many were removed.
fn prune_logs(dir: &Path, config: &FileLoggingConfig, now: SystemTime) -> io::Result<usize> {
    let mut logs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_log = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        let meta = entry.metadata()?;
        if is_log && meta.is_file() {
            logs.push((meta.modified().unwrap_or(now), entry.path()));
        }
    }
    logs.sort();

    let expired = config.retention_max_age_days.map_or(0, |days| {
        let max_age = Duration::from_secs(days.saturating_mul(24 * 60 * 60));
        logs.iter()
            .take_while(|(modified, _)| {
                now.duration_since(*modified).unwrap_or(Duration::ZERO) > max_age
            })
            .count()
    });
    let excess = config
        .retention_max_files
        .map_or(0, |max| logs.len().saturating_sub(max));

    Ok(logs
        .iter()
        .take(expired.max(excess))
        .filter(|(_, path)| fs::remove_file(path).is_ok())
        .count())
}
