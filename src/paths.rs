//! On-disk layout of restore state, plus XDG directory helpers.

use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::core::{AssetKey, CloneSpec, PeerAddress, SnapshotEpoch, VolumeGuid};

/// Base directory for persistent state (ledger, leases, exit codes).
///
/// Uses `BMR_DATA_DIR` if set, otherwise `$XDG_DATA_HOME/bmr-rs` or
/// `~/.local/share/bmr-rs`.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = thread_local_data_dir_override() {
        return dir;
    }

    if let Ok(dir) = std::env::var("BMR_DATA_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("bmr-rs")
}

/// Base directory for configuration files.
///
/// Uses `BMR_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/bmr-rs` or
/// `~/.config/bmr-rs`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("BMR_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("bmr-rs")
}

#[doc(hidden)]
pub struct DataDirOverride {
    prev: Option<PathBuf>,
}

impl DataDirOverride {
    pub fn new(path: Option<PathBuf>) -> Self {
        let prev = DATA_DIR_OVERRIDE.with(|cell| cell.replace(path));
        Self { prev }
    }
}

impl Drop for DataDirOverride {
    fn drop(&mut self) {
        let prev = self.prev.take();
        DATA_DIR_OVERRIDE.with(|cell| {
            cell.replace(prev);
        });
    }
}

#[doc(hidden)]
pub fn override_data_dir_for_tests(path: Option<PathBuf>) -> DataDirOverride {
    DataDirOverride::new(path)
}

fn thread_local_data_dir_override() -> Option<PathBuf> {
    DATA_DIR_OVERRIDE.with(|cell| cell.borrow().clone())
}

thread_local! {
    static DATA_DIR_OVERRIDE: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}

/// Resolved state root.
///
/// Services capture one at construction so worker threads never consult the
/// (thread-local) override themselves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn current() -> Self {
        Self::new(data_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn mirror_dir(&self) -> PathBuf {
        self.root.join("mirror")
    }

    /// Exit code of the streaming job for one (peer, asset, volume, snapshot).
    pub fn mirror_exit_path(
        &self,
        peer: &PeerAddress,
        asset: &AssetKey,
        volume: &VolumeGuid,
        snapshot: SnapshotEpoch,
    ) -> PathBuf {
        self.mirror_dir().join(format!(
            "{}{}-{}-{}.exit",
            mirror_exit_prefix(peer),
            asset.file_component(),
            volume,
            snapshot
        ))
    }

    pub fn leases_dir(&self) -> PathBuf {
        self.mirror_dir().join("leases")
    }

    pub fn lease_path(&self, peer: &PeerAddress, asset: &AssetKey) -> PathBuf {
        self.leases_dir()
            .join(format!("{}-{}.lease", peer.file_component(), asset.file_component()))
    }

    pub fn clones_dir(&self) -> PathBuf {
        self.root.join("clones")
    }

    /// Creation timestamp of a clone; the staleness fallback for the sweep.
    pub fn clone_timestamp_path(&self, spec: &CloneSpec) -> PathBuf {
        self.clones_dir()
            .join(format!("{}.created", spec.clone_name()))
    }

    /// Per-volume progress logs written by push-style restores.
    pub fn progress_dir(&self, spec: &CloneSpec) -> PathBuf {
        self.root.join("progress").join(spec.clone_name())
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    pub fn job_pid_path(&self, label: &str) -> PathBuf {
        self.jobs_dir().join(format!("{label}.pid"))
    }

    pub fn restore_ledger_path(&self) -> PathBuf {
        self.root.join("restores.json")
    }
}

/// Every exit-code file of `peer`, and no other peer's, starts with this.
pub fn mirror_exit_prefix(peer: &PeerAddress) -> String {
    format!("{}-", peer.file_component())
}

/// Write through a sibling temp file and rename over `path`.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path missing parent directory")
    })?;
    fs::create_dir_all(dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    io::Write::write_all(&mut temp, data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// `remove_file` that treats an already-absent file as success.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
