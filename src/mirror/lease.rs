//! Per-(peer, asset) mirror reservation.
//!
//! A lease is a JSON file published with a no-clobber link, so creating it
//! is the atomic "reserve" step and its content is complete the moment it
//! becomes visible. While `Starting`, the lease belongs to the process that
//! wrote it; once `Streaming`, it lives as long as the mirror job does.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::LeaseError;
use crate::backend::jobs::process_alive;
use crate::backend::{JobLabel, JobRunner};
use crate::core::{AssetKey, PeerAddress, SnapshotEpoch, WallClock};
use crate::paths::{self, StateDir};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeasePhase {
    /// Discovery, login and launch in progress in the owning process.
    Starting,
    /// Handed over to the background job.
    Streaming,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseMeta {
    pub peer: PeerAddress,
    pub asset: AssetKey,
    pub label: String,
    pub pid: u32,
    pub token: Uuid,
    pub phase: LeasePhase,
    pub started_at: WallClock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_snapshot: Option<SnapshotEpoch>,
}

impl LeaseMeta {
    pub fn job_label(&self) -> Option<JobLabel> {
        JobLabel::new(self.label.as_str()).ok()
    }

    /// Live while its job runs, or while its starting owner is alive.
    pub fn is_live(&self, jobs: &dyn JobRunner) -> Result<bool, LeaseError> {
        if let Some(label) = self.job_label()
            && jobs.is_running(&label)?
        {
            return Ok(true);
        }
        Ok(match self.phase {
            LeasePhase::Starting => i32::try_from(self.pid).is_ok_and(process_alive),
            LeasePhase::Streaming => false,
        })
    }
}

#[derive(Debug)]
pub struct MirrorLease {
    path: PathBuf,
    meta: LeaseMeta,
    retained: bool,
}

impl MirrorLease {
    pub fn acquire(
        state_dir: &StateDir,
        peer: &PeerAddress,
        asset: &AssetKey,
        label: &JobLabel,
        jobs: &dyn JobRunner,
    ) -> Result<Self, LeaseError> {
        let dir = state_dir.leases_dir();
        fs::create_dir_all(&dir).map_err(|err| LeaseError::io(&dir, err))?;
        let path = state_dir.lease_path(peer, asset);
        let meta = LeaseMeta {
            peer: peer.clone(),
            asset: asset.clone(),
            label: label.as_str().to_string(),
            pid: std::process::id(),
            token: Uuid::new_v4(),
            phase: LeasePhase::Starting,
            started_at: WallClock::now(),
            target_snapshot: None,
        };
        let held = || LeaseError::Held {
            peer: peer.clone(),
            asset: asset.clone(),
            label: label.clone(),
        };

        // A second pass covers reclaiming one stale lease.
        for _ in 0..2 {
            match publish_new(&dir, &path, &meta) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), token = %meta.token, "acquired mirror lease");
                    return Ok(Self {
                        path,
                        meta,
                        retained: false,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(LeaseError::io(&path, err)),
            }
            let existing = match read_meta(&path) {
                Ok(existing) => existing,
                // Removed between our attempt and the read.
                Err(LeaseError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                    continue;
                }
                Err(err) => return Err(err),
            };
            if existing.is_live(jobs)? {
                return Err(held());
            }
            tracing::warn!(
                path = %path.display(),
                owner_pid = existing.pid,
                phase = ?existing.phase,
                "reclaiming stale mirror lease"
            );
            remove_if_token(&path, existing.token)?;
        }
        Err(held())
    }

    pub fn meta(&self) -> &LeaseMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand the lease over to the launched job; it outlives this handle.
    pub fn into_streaming(mut self, target: SnapshotEpoch) -> Result<LeaseMeta, LeaseError> {
        self.meta.phase = LeasePhase::Streaming;
        self.meta.target_snapshot = Some(target);
        let bytes = serde_json::to_vec(&self.meta).map_err(|source| LeaseError::MetadataCorrupt {
            path: self.path.clone(),
            source,
        })?;
        paths::atomic_write(&self.path, &bytes).map_err(|err| LeaseError::io(&self.path, err))?;
        self.retained = true;
        Ok(self.meta.clone())
    }

    pub fn release(mut self) -> Result<(), LeaseError> {
        self.retained = true;
        remove_if_token(&self.path, self.meta.token)
    }
}

impl Drop for MirrorLease {
    fn drop(&mut self) {
        if !self.retained
            && let Err(err) = remove_if_token(&self.path, self.meta.token)
        {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release mirror lease");
        }
    }
}

/// Every readable lease; unreadable ones are logged and skipped.
pub fn read_leases(state_dir: &StateDir) -> Result<Vec<(PathBuf, LeaseMeta)>, LeaseError> {
    let dir = state_dir.leases_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(LeaseError::io(&dir, err)),
    };
    let mut leases = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| LeaseError::io(&dir, err))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("lease") {
            continue;
        }
        match read_meta(&path) {
            Ok(meta) => leases.push((path, meta)),
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "skipping unreadable lease"),
        }
    }
    leases.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(leases)
}

fn publish_new(dir: &Path, path: &Path, meta: &LeaseMeta) -> io::Result<()> {
    let bytes = serde_json::to_vec(meta).map_err(io::Error::other)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(&bytes)?;
    temp.as_file().sync_all()?;
    temp.persist_noclobber(path).map_err(|err| err.error)?;
    Ok(())
}

fn read_meta(path: &Path) -> Result<LeaseMeta, LeaseError> {
    let bytes = fs::read(path).map_err(|err| LeaseError::io(path, err))?;
    serde_json::from_slice(&bytes).map_err(|source| LeaseError::MetadataCorrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Remove the lease only if it is still the one identified by `token`.
fn remove_if_token(path: &Path, token: Uuid) -> Result<(), LeaseError> {
    match read_meta(path) {
        Ok(meta) if meta.token == token => {
            paths::remove_if_exists(path).map_err(|err| LeaseError::io(path, err))?;
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(LeaseError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Remove a lease regardless of owner.
pub(crate) fn remove_lease(path: &Path) -> Result<bool, LeaseError> {
    paths::remove_if_exists(path).map_err(|err| LeaseError::io(path, err))
}
