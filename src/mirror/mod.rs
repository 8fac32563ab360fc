//! Incremental mirroring of an exported restore target.
//!
//! `start` advances a peer's already-exported volume from the last mirrored
//! snapshot to a newer one by streaming the snapshot delta straight onto the
//! logged-in block device in a background job. Completion is reported only
//! through the per-(peer, asset, volume, snapshot) exit file read by
//! `status`; restore records are never touched here.

mod error;
pub mod lease;
pub mod pipeline;
pub mod session;

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

pub use error::{LeaseError, MirrorError};
pub use lease::{LeaseMeta, LeasePhase, MirrorLease};
pub use pipeline::{PartitionGeometry, StreamPlan};
pub use session::{LaunchWindow, MirrorSession};

use crate::backend::{
    BackendError, Initiator, JobLabel, JobRunner, JobSpec, PartitionInspector, StorageBackend,
};
use crate::config::{MirrorConfig, StorageConfig};
use crate::core::{AssetKey, PeerAddress, SnapshotEpoch, VolumeGuid};
use crate::paths::{self, StateDir};

/// Collaborators a mirror drives.
#[derive(Clone)]
pub struct MirrorBackends {
    pub initiator: Arc<dyn Initiator>,
    pub storage: Arc<dyn StorageBackend>,
    pub partitions: Arc<dyn PartitionInspector>,
    pub jobs: Arc<dyn JobRunner>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorRequest {
    pub peer: PeerAddress,
    pub asset: AssetKey,
    pub volume: VolumeGuid,
    pub last_mirrored: SnapshotEpoch,
    /// Latest snapshot of the asset when unset.
    pub target: Option<SnapshotEpoch>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorStarted {
    pub label: JobLabel,
    pub target_snapshot: SnapshotEpoch,
    pub target_name: String,
    pub device: PathBuf,
    pub geometry: PartitionGeometry,
    pub exit_file: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorOutcome {
    Succeeded,
    /// Non-zero exit code, or `None` when the file held no number.
    Failed(Option<i32>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MirrorStatus {
    pub running: bool,
    /// Outcome of the last completed run for this snapshot, if any.
    pub outcome: Option<MirrorOutcome>,
}

impl MirrorStatus {
    pub fn succeeded(&self) -> bool {
        self.outcome == Some(MirrorOutcome::Succeeded)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MirrorCleanup {
    pub exit_files_removed: usize,
    pub leases_removed: usize,
}

/// Job label shared by every mirror of `asset` to `peer`, distinct for every
/// other pair.
pub fn mirror_job_label(peer: &PeerAddress, asset: &AssetKey) -> Result<JobLabel, MirrorError> {
    Ok(JobLabel::new(format!(
        "mirror-{}-{}",
        peer.file_component(),
        asset.file_component()
    ))?)
}

pub struct MirrorService {
    backends: MirrorBackends,
    config: MirrorConfig,
    storage: StorageConfig,
    state_dir: StateDir,
}

impl MirrorService {
    pub fn new(
        backends: MirrorBackends,
        config: MirrorConfig,
        storage: StorageConfig,
        state_dir: StateDir,
    ) -> Self {
        Self {
            backends,
            config,
            storage,
            state_dir,
        }
    }

    pub fn backends(&self) -> &MirrorBackends {
        &self.backends
    }

    /// Start advancing `request.volume` on `request.peer` to a newer snapshot.
    ///
    /// Everything that can be checked locally (reservation, snapshot choice,
    /// partition layout) is checked before the peer is contacted.
    pub fn start(&self, request: &MirrorRequest) -> Result<MirrorStarted, MirrorError> {
        let MirrorRequest {
            peer,
            asset,
            volume,
            last_mirrored,
            target,
        } = request;
        let span = tracing::info_span!("mirror_start", %peer, %asset, %volume);
        let _enter = span.enter();

        let jobs = self.backends.jobs.as_ref();
        let label = mirror_job_label(peer, asset)?;
        let already_running = || MirrorError::AlreadyRunning {
            peer: peer.clone(),
            asset: asset.clone(),
        };
        let lease = match MirrorLease::acquire(&self.state_dir, peer, asset, &label, jobs) {
            Ok(lease) => lease,
            Err(LeaseError::Held { .. }) => return Err(already_running()),
            Err(err) => return Err(err.into()),
        };
        if jobs.is_running(&label)? {
            return Err(already_running());
        }

        let target = self.choose_target(asset, *last_mirrored, *target)?;
        let image = self
            .backends
            .storage
            .snapshot_dir(asset, target)
            .join(self.storage.image_file_name(volume));
        let table = self.backends.partitions.inspect(&image)?;
        let geometry = PartitionGeometry::from_table(&image, &table)?;

        let exit_file = self.state_dir.mirror_exit_path(peer, asset, volume, target);
        let base_snapshot_dir = self.backends.storage.snapshot_dir(asset, *last_mirrored);
        let target_snapshot_dir = self.backends.storage.snapshot_dir(asset, target);
        let window = LaunchWindow {
            settle: self.config.settle_delay(),
            attempts: self.config.start_poll_attempts,
            interval: self.config.start_poll_interval(),
        };

        let session = MirrorSession::new(self.backends.initiator.as_ref(), peer)
            .discover(volume)?
            .login()?;
        let streaming = session.stream(jobs, window, |device| {
            // The previous run's outcome stays readable until a job replaces it.
            let mirror_dir = self.state_dir.mirror_dir();
            fs::create_dir_all(&mirror_dir).map_err(|err| BackendError::io(&mirror_dir, err))?;
            paths::remove_if_exists(&exit_file).map_err(|err| BackendError::io(&exit_file, err))?;
            let plan = StreamPlan {
                base_snapshot_dir,
                target_snapshot_dir,
                volume: volume.clone(),
                geometry,
                device: device.to_path_buf(),
                exit_file: exit_file.clone(),
            };
            Ok(JobSpec {
                label: label.clone(),
                program: self.config.shell.clone(),
                args: vec!["-c".into(), plan.script(&self.config)],
                detached: true,
            })
        })?;

        if let Err(err) = lease.into_streaming(target) {
            // The job is already running and is what `running` reports.
            tracing::warn!(error = %err, "failed to hand mirror lease to job");
        }
        tracing::info!(
            %target,
            device = %streaming.device().display(),
            offset = geometry.offset,
            length = geometry.length,
            "mirror streaming"
        );
        Ok(MirrorStarted {
            label: streaming.label().clone(),
            target_snapshot: target,
            target_name: streaming.target_name().to_string(),
            device: streaming.device().to_path_buf(),
            geometry,
            exit_file,
        })
    }

    fn choose_target(
        &self,
        asset: &AssetKey,
        last_mirrored: SnapshotEpoch,
        requested: Option<SnapshotEpoch>,
    ) -> Result<SnapshotEpoch, MirrorError> {
        let snapshots = self.backends.storage.list_snapshots(asset)?;
        let target = match requested {
            Some(target) => target,
            None => *snapshots
                .last()
                .ok_or_else(|| MirrorError::NoSnapshots {
                    asset: asset.clone(),
                })?,
        };
        if target <= last_mirrored {
            return Err(MirrorError::AlreadyUpToDate {
                asset: asset.clone(),
                last_mirrored,
                target,
            });
        }
        for snapshot in [target, last_mirrored] {
            if !snapshots.contains(&snapshot) {
                return Err(MirrorError::SnapshotMissing {
                    asset: asset.clone(),
                    snapshot,
                });
            }
        }
        Ok(target)
    }

    pub fn status(
        &self,
        peer: &PeerAddress,
        asset: &AssetKey,
        volume: &VolumeGuid,
        snapshot: SnapshotEpoch,
    ) -> Result<MirrorStatus, MirrorError> {
        let running = self.running(peer, asset)?;
        let exit_file = self.state_dir.mirror_exit_path(peer, asset, volume, snapshot);
        let outcome = match fs::read_to_string(&exit_file) {
            Ok(raw) => parse_exit_code(&raw),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(BackendError::io(&exit_file, err).into()),
        };
        Ok(MirrorStatus { running, outcome })
    }

    pub fn running(&self, peer: &PeerAddress, asset: &AssetKey) -> Result<bool, MirrorError> {
        let label = mirror_job_label(peer, asset)?;
        Ok(self.backends.jobs.is_running(&label)?)
    }

    /// Leases whose mirror is starting or streaming right now.
    pub fn active_mirrors(&self) -> Result<Vec<LeaseMeta>, MirrorError> {
        let jobs = self.backends.jobs.as_ref();
        let mut active = Vec::new();
        for (_, meta) in lease::read_leases(&self.state_dir)? {
            if meta.is_live(jobs)? {
                active.push(meta);
            }
        }
        Ok(active)
    }

    pub fn running_for_asset(&self, asset: &AssetKey) -> Result<bool, MirrorError> {
        Ok(self
            .active_mirrors()?
            .iter()
            .any(|meta| &meta.asset == asset))
    }

    pub fn running_for_peer(&self, peer: &PeerAddress) -> Result<bool, MirrorError> {
        Ok(self.active_mirrors()?.iter().any(|meta| &meta.peer == peer))
    }

    /// Drop every session, discovery record, exit file and stale lease of `peer`.
    pub fn cleanup(&self, peer: &PeerAddress) -> Result<MirrorCleanup, MirrorError> {
        let span = tracing::info_span!("mirror_cleanup", %peer);
        let _enter = span.enter();

        if self.running_for_peer(peer)? {
            tracing::warn!("cleaning up a peer with a running mirror");
        }
        let initiator = self.backends.initiator.as_ref();
        initiator.logout_all(peer)?;
        initiator.purge_discovery(peer)?;

        let mut report = MirrorCleanup::default();
        let prefix = paths::mirror_exit_prefix(peer);
        let mirror_dir = self.state_dir.mirror_dir();
        match fs::read_dir(&mirror_dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.map_err(|err| BackendError::io(&mirror_dir, err))?;
                    let Ok(name) = entry.file_name().into_string() else {
                        continue;
                    };
                    if !name.starts_with(&prefix) || !name.ends_with(".exit") {
                        continue;
                    }
                    let path = entry.path();
                    if paths::remove_if_exists(&path).map_err(|err| BackendError::io(&path, err))? {
                        report.exit_files_removed += 1;
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(BackendError::io(&mirror_dir, err).into()),
        }

        let jobs = self.backends.jobs.as_ref();
        for (path, meta) in lease::read_leases(&self.state_dir)? {
            if &meta.peer == peer && !meta.is_live(jobs)? && lease::remove_lease(&path)? {
                report.leases_removed += 1;
            }
        }
        tracing::info!(
            exit_files = report.exit_files_removed,
            leases = report.leases_removed,
            "peer cleaned up"
        );
        Ok(report)
    }
}

fn parse_exit_code(raw: &str) -> Option<MirrorOutcome> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Some(match raw.parse::<i32>() {
        Ok(0) => MirrorOutcome::Succeeded,
        Ok(code) => MirrorOutcome::Failed(Some(code)),
        Err(_) => MirrorOutcome::Failed(None),
    })
}
