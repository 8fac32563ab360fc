//! Clone-capable snapshot storage.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Command;

use super::command;
use super::error::BackendError;
use crate::config::StorageConfig;
use crate::core::{AssetKey, CloneSpec, SnapshotEpoch};

pub trait StorageBackend: Send + Sync {
    /// Create a writable clone of the snapshot; returns its mount point.
    fn create_clone(&self, spec: &CloneSpec) -> Result<PathBuf, BackendError>;

    /// Destroy the clone. `NotFound` when it does not exist.
    fn destroy_clone(&self, spec: &CloneSpec) -> Result<(), BackendError>;

    fn clone_exists(&self, spec: &CloneSpec) -> Result<bool, BackendError>;

    /// Names of every live clone (see [`CloneSpec::clone_name`]).
    fn list_clones(&self) -> Result<Vec<String>, BackendError>;

    fn list_snapshots(&self, asset: &AssetKey) -> Result<BTreeSet<SnapshotEpoch>, BackendError>;

    /// Read-only directory holding the snapshot's volume images.
    fn snapshot_dir(&self, asset: &AssetKey, snapshot: SnapshotEpoch) -> PathBuf;

    fn clone_mount_point(&self, spec: &CloneSpec) -> PathBuf;
}

/// ZFS-backed storage: `<agents_dataset>/<asset>@<epoch>` cloned under `<pool>`.
#[derive(Clone, Debug)]
pub struct ZfsStorage {
    config: StorageConfig,
    zfs: PathBuf,
}

impl ZfsStorage {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            zfs: PathBuf::from("zfs"),
        }
    }

    pub fn with_binary(mut self, zfs: impl Into<PathBuf>) -> Self {
        self.zfs = zfs.into();
        self
    }

    fn zfs(&self) -> Command {
        Command::new(&self.zfs)
    }

    fn asset_dataset(&self, asset: &AssetKey) -> String {
        format!("{}/{}", self.config.agents_dataset, asset)
    }
}

impl StorageBackend for ZfsStorage {
    fn create_clone(&self, spec: &CloneSpec) -> Result<PathBuf, BackendError> {
        let source = format!("{}@{}", self.asset_dataset(spec.asset()), spec.snapshot());
        let target = spec.dataset_name(&self.config.pool);
        let mount_point = self.clone_mount_point(spec);
        command::run(self.zfs().args(["clone", "-o"]).arg(format!(
            "mountpoint={}",
            mount_point.display()
        )).arg(&source).arg(&target))?;
        tracing::info!(%source, %target, "created clone");
        Ok(mount_point)
    }

    fn destroy_clone(&self, spec: &CloneSpec) -> Result<(), BackendError> {
        let target = spec.dataset_name(&self.config.pool);
        let out = command::output(self.zfs().args(["destroy", "-R"]).arg(&target))?;
        if out.success() {
            tracing::info!(%target, "destroyed clone");
            return Ok(());
        }
        if out.stderr.contains("does not exist") {
            return Err(BackendError::not_found("clone", target));
        }
        Err(BackendError::CommandFailed {
            program: "zfs destroy".into(),
            code: out.code,
            stderr: out.stderr,
        })
    }

    fn clone_exists(&self, spec: &CloneSpec) -> Result<bool, BackendError> {
        let target = spec.dataset_name(&self.config.pool);
        let out = command::output(self.zfs().args(["list", "-H", "-o", "name"]).arg(&target))?;
        Ok(out.success())
    }

    fn list_clones(&self) -> Result<Vec<String>, BackendError> {
        let out = command::run(
            self.zfs()
                .args(["list", "-H", "-o", "name", "-d", "1"])
                .arg(&self.config.pool),
        )?;
        Ok(parse_child_names(&out.stdout, &self.config.pool))
    }

    fn list_snapshots(&self, asset: &AssetKey) -> Result<BTreeSet<SnapshotEpoch>, BackendError> {
        let dataset = self.asset_dataset(asset);
        let out = command::output(
            self.zfs()
                .args(["list", "-H", "-t", "snapshot", "-o", "name", "-d", "1"])
                .arg(&dataset),
        )?;
        if !out.success() {
            if out.stderr.contains("does not exist") {
                return Err(BackendError::not_found("asset dataset", dataset));
            }
            return Err(BackendError::CommandFailed {
                program: "zfs list".into(),
                code: out.code,
                stderr: out.stderr,
            });
        }
        Ok(parse_snapshot_epochs(&out.stdout))
    }

    fn snapshot_dir(&self, asset: &AssetKey, snapshot: SnapshotEpoch) -> PathBuf {
        self.config
            .agents_mount_root
            .join(asset.as_str())
            .join(".zfs")
            .join("snapshot")
            .join(snapshot.to_string())
    }

    fn clone_mount_point(&self, spec: &CloneSpec) -> PathBuf {
        spec.mount_point(&self.config.mount_root)
    }
}

/// `zfs list -d 1 <parent>` includes the parent itself; keep direct children only.
fn parse_child_names(stdout: &str, parent: &str) -> Vec<String> {
    let prefix = format!("{}/", parent.trim_end_matches('/'));
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix(&prefix))
        .filter(|name| !name.is_empty() && !name.contains('/'))
        .map(str::to_string)
        .collect()
}

/// Snapshot names are `<dataset>@<epoch>`; non-numeric snapshots are skipped.
fn parse_snapshot_epochs(stdout: &str) -> BTreeSet<SnapshotEpoch> {
    stdout
        .lines()
        .filter_map(|line| line.trim().rsplit_once('@'))
        .filter_map(|(_, epoch)| epoch.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::CloneSuffix;

    #[test]
    fn child_names_skip_parent_and_grandchildren() {
        let stdout = "homePool\nhomePool/A1-1000-bmr\nhomePool/home\nhomePool/home/agents\n";
        assert_eq!(
            parse_child_names(stdout, "homePool"),
            vec!["A1-1000-bmr".to_string(), "home".to_string()]
        );
    }

    #[test]
    fn snapshot_epochs_are_sorted_and_filtered() {
        let stdout = "homePool/home/agents/A1@1100\nhomePool/home/agents/A1@1000\nhomePool/home/agents/A1@manual\n";
        let epochs: Vec<_> = parse_snapshot_epochs(stdout).into_iter().collect();
        assert_eq!(epochs, vec![SnapshotEpoch(1000), SnapshotEpoch(1100)]);
    }

    #[test]
    fn layout_follows_config() {
        let storage = ZfsStorage::new(StorageConfig::default());
        let asset = AssetKey::new("A1").unwrap();
        assert_eq!(
            storage.snapshot_dir(&asset, SnapshotEpoch(1000)),
            PathBuf::from("/home/agents/A1/.zfs/snapshot/1000")
        );
        let spec = CloneSpec::new(asset, SnapshotEpoch(1000), CloneSuffix::bmr());
        assert_eq!(
            storage.clone_mount_point(&spec),
            PathBuf::from("/homePool/A1-1000-bmr")
        );
    }
}
