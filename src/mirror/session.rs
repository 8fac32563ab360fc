//! Storage-protocol session typestate.
//!
//! Idle -> Discovered -> LoggedIn -> Streaming. Each transition consumes the
//! session; every failure after login logs out again before the error is
//! returned, so a failed start leaves no session behind.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::error::MirrorError;
use crate::backend::{DiscoveredTarget, Initiator, JobLabel, JobRunner, JobSpec};
use crate::core::{PeerAddress, VolumeGuid};

/// Nothing contacted yet.
pub struct Idle;

/// Exactly one target matching the volume was advertised.
pub struct Discovered {
    target: DiscoveredTarget,
}

/// Logged in to the target; must be logged out on failure.
pub struct LoggedIn {
    target: DiscoveredTarget,
}

/// The streaming job is running against the target's block device.
pub struct Streaming {
    target: DiscoveredTarget,
    device: PathBuf,
    label: JobLabel,
}

/// How long and how often to wait for a launched job.
#[derive(Clone, Copy, Debug)]
pub struct LaunchWindow {
    pub settle: Duration,
    pub attempts: u32,
    pub interval: Duration,
}

pub struct MirrorSession<'a, Phase> {
    initiator: &'a dyn Initiator,
    peer: &'a PeerAddress,
    phase: Phase,
}

impl<'a> MirrorSession<'a, Idle> {
    pub fn new(initiator: &'a dyn Initiator, peer: &'a PeerAddress) -> Self {
        Self {
            initiator,
            peer,
            phase: Idle,
        }
    }

    /// Exactly one advertised target may carry the volume guid in its name.
    pub fn discover(
        self,
        volume: &VolumeGuid,
    ) -> Result<MirrorSession<'a, Discovered>, MirrorError> {
        let targets = self.initiator.discover(self.peer)?;
        let mut matching: Vec<DiscoveredTarget> = targets
            .into_iter()
            .filter(|target| target.name.contains(volume.as_str()))
            .collect();
        if matching.len() != 1 {
            return Err(MirrorError::TargetCount {
                peer: self.peer.clone(),
                volume: volume.clone(),
                found: matching.len(),
            });
        }
        let target = matching.remove(0);
        tracing::debug!(peer = %self.peer, target = %target.name, "discovered target");
        Ok(MirrorSession {
            initiator: self.initiator,
            peer: self.peer,
            phase: Discovered { target },
        })
    }
}

impl<'a> MirrorSession<'a, Discovered> {
    pub fn target_name(&self) -> &str {
        &self.phase.target.name
    }

    pub fn login(self) -> Result<MirrorSession<'a, LoggedIn>, MirrorError> {
        self.initiator.login(self.peer, &self.phase.target.name)?;
        tracing::info!(peer = %self.peer, target = %self.phase.target.name, "logged in");
        Ok(MirrorSession {
            initiator: self.initiator,
            peer: self.peer,
            phase: LoggedIn {
                target: self.phase.target,
            },
        })
    }
}

impl<'a> MirrorSession<'a, LoggedIn> {
    pub fn target_name(&self) -> &str {
        &self.phase.target.name
    }

    /// Wait for the device node, launch the job that streams onto it and
    /// wait for the job to come up.
    pub fn stream<F>(
        self,
        jobs: &dyn JobRunner,
        window: LaunchWindow,
        job_for_device: F,
    ) -> Result<MirrorSession<'a, Streaming>, MirrorError>
    where
        F: FnOnce(&Path) -> Result<JobSpec, MirrorError>,
    {
        thread::sleep(window.settle);
        match self.launch(jobs, window, job_for_device) {
            Ok((device, label)) => Ok(MirrorSession {
                initiator: self.initiator,
                peer: self.peer,
                phase: Streaming {
                    target: self.phase.target,
                    device,
                    label,
                },
            }),
            Err(err) => {
                self.abort();
                Err(err)
            }
        }
    }

    fn launch<F>(
        &self,
        jobs: &dyn JobRunner,
        window: LaunchWindow,
        job_for_device: F,
    ) -> Result<(PathBuf, JobLabel), MirrorError>
    where
        F: FnOnce(&Path) -> Result<JobSpec, MirrorError>,
    {
        let target = &self.phase.target.name;
        let mut devices = self.initiator.block_devices(self.peer, target)?;
        if devices.len() != 1 {
            return Err(MirrorError::BlockDeviceCount {
                target: target.clone(),
                found: devices.len(),
            });
        }
        let device = devices.remove(0);
        let job = job_for_device(&device)?;
        jobs.launch(&job)?;
        if !jobs.await_started(&job.label, window.attempts, window.interval)? {
            return Err(MirrorError::JobNotStarted {
                label: job.label,
                attempts: window.attempts,
            });
        }
        Ok((device, job.label))
    }

    /// Log out, keeping whatever error brought us here as the one reported.
    pub fn abort(self) {
        let target = &self.phase.target.name;
        match self.initiator.logout(self.peer, target) {
            Ok(()) => tracing::info!(peer = %self.peer, %target, "logged out after failed start"),
            Err(err) => {
                tracing::error!(peer = %self.peer, %target, error = %err, "logout after failed start failed")
            }
        }
    }
}

impl MirrorSession<'_, Streaming> {
    pub fn target_name(&self) -> &str {
        &self.phase.target.name
    }

    pub fn device(&self) -> &Path {
        &self.phase.device
    }

    pub fn label(&self) -> &JobLabel {
        &self.phase.label
    }
}
