use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub export: ExportConfig,
    pub mirror: MirrorConfig,
    pub cleaner: CleanerConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Minutely,
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
    pub retention_max_age_days: Option<u64>,
    pub retention_max_files: Option<usize>,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
            retention_max_age_days: Some(14),
            retention_max_files: Some(14),
        }
    }
}

/// Dataset and mount layout of the snapshot store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Parent dataset of restore clones.
    pub pool: String,
    /// Parent dataset of per-asset backup datasets.
    pub agents_dataset: String,
    /// Mount root of restore clones.
    pub mount_root: PathBuf,
    /// Mount root of per-asset backup datasets.
    pub agents_mount_root: PathBuf,
    /// Extension of per-volume disk images inside a snapshot.
    pub image_extension: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pool: "homePool".into(),
            agents_dataset: "homePool/home/agents".into(),
            mount_root: PathBuf::from("/homePool"),
            agents_mount_root: PathBuf::from("/home/agents"),
            image_extension: "datto".into(),
        }
    }
}

impl StorageConfig {
    pub fn image_file_name(&self, volume: &crate::core::VolumeGuid) -> String {
        format!("{}.{}", volume, self.image_extension)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub iqn_prefix: String,
    pub password_len: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            iqn_prefix: "iqn.2007-01.net.bmr.restore".into(),
            password_len: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub settle_delay_ms: u64,
    pub start_poll_interval_ms: u64,
    pub start_poll_attempts: u32,
    pub rate_limit_bytes_per_sec: Option<u64>,
    pub diff_program: PathBuf,
    pub writer_program: PathBuf,
    pub throttle_program: PathBuf,
    pub shell: PathBuf,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 2_000,
            start_poll_interval_ms: 1_000,
            start_poll_attempts: 10,
            rate_limit_bytes_per_sec: None,
            diff_program: PathBuf::from("snapdiff"),
            writer_program: PathBuf::from("blockwrite"),
            throttle_program: PathBuf::from("pv"),
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl MirrorConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn start_poll_interval(&self) -> Duration {
        Duration::from_millis(self.start_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    pub grace_period_secs: u64,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 24 * 60 * 60,
        }
    }
}

impl CleanerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigLayer {
    pub logging: LoggingConfigOverride,
    pub storage: StorageConfigOverride,
    pub export: ExportConfigOverride,
    pub mirror: MirrorConfigOverride,
    pub cleaner: CleanerConfigOverride,
}

impl ConfigLayer {
    pub fn apply_to(&self, base: &mut Config) {
        self.logging.apply_to(&mut base.logging);
        self.storage.apply_to(&mut base.storage);
        self.export.apply_to(&mut base.export);
        self.mirror.apply_to(&mut base.mirror);
        self.cleaner.apply_to(&mut base.cleaner);
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
    pub retention_max_age_days: Option<u64>,
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
        if let Some(days) = self.retention_max_age_days {
            target.retention_max_age_days = Some(days);
        }
        if let Some(files) = self.retention_max_files {
            target.retention_max_files = Some(files);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfigOverride {
    pub pool: Option<String>,
    pub agents_dataset: Option<String>,
    pub mount_root: Option<PathBuf>,
    pub agents_mount_root: Option<PathBuf>,
    pub image_extension: Option<String>,
}

impl StorageConfigOverride {
    pub fn apply_to(&self, target: &mut StorageConfig) {
        if let Some(pool) = self.pool.as_ref() {
            target.pool = pool.clone();
        }
        if let Some(dataset) = self.agents_dataset.as_ref() {
            target.agents_dataset = dataset.clone();
        }
        if let Some(root) = self.mount_root.as_ref() {
            target.mount_root = root.clone();
        }
        if let Some(root) = self.agents_mount_root.as_ref() {
            target.agents_mount_root = root.clone();
        }
        if let Some(ext) = self.image_extension.as_ref() {
            target.image_extension = ext.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExportConfigOverride {
    pub iqn_prefix: Option<String>,
    pub password_len: Option<usize>,
}

impl ExportConfigOverride {
    pub fn apply_to(&self, target: &mut ExportConfig) {
        if let Some(prefix) = self.iqn_prefix.as_ref() {
            target.iqn_prefix = prefix.clone();
        }
        if let Some(len) = self.password_len {
            target.password_len = len;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MirrorConfigOverride {
    pub settle_delay_ms: Option<u64>,
    pub start_poll_interval_ms: Option<u64>,
    pub start_poll_attempts: Option<u32>,
    pub rate_limit_bytes_per_sec: Option<u64>,
    pub diff_program: Option<PathBuf>,
    pub writer_program: Option<PathBuf>,
    pub throttle_program: Option<PathBuf>,
    pub shell: Option<PathBuf>,
}

impl MirrorConfigOverride {
    pub fn apply_to(&self, target: &mut MirrorConfig) {
        if let Some(ms) = self.settle_delay_ms {
            target.settle_delay_ms = ms;
        }
        if let Some(ms) = self.start_poll_interval_ms {
            target.start_poll_interval_ms = ms;
        }
        if let Some(attempts) = self.start_poll_attempts {
            target.start_poll_attempts = attempts;
        }
        if let Some(rate) = self.rate_limit_bytes_per_sec {
            target.rate_limit_bytes_per_sec = Some(rate);
        }
        if let Some(program) = self.diff_program.as_ref() {
            target.diff_program = program.clone();
        }
        if let Some(program) = self.writer_program.as_ref() {
            target.writer_program = program.clone();
        }
        if let Some(program) = self.throttle_program.as_ref() {
            target.throttle_program = program.clone();
        }
        if let Some(shell) = self.shell.as_ref() {
            target.shell = shell.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CleanerConfigOverride {
    pub grace_period_secs: Option<u64>,
}

impl CleanerConfigOverride {
    pub fn apply_to(&self, target: &mut CleanerConfig) {
        if let Some(secs) = self.grace_period_secs {
            target.grace_period_secs = secs;
        }
    }
}
