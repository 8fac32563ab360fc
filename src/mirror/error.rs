use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::backend::{BackendError, JobLabel};
use crate::core::{AssetKey, CoreError, PeerAddress, SnapshotEpoch, VolumeGuid};
use crate::error::{Effect, Transience};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LeaseError {
    #[error("mirror for {asset} on {peer} is already running (job {label})")]
    Held {
        peer: PeerAddress,
        asset: AssetKey,
        label: JobLabel,
    },
    #[error("lease metadata corrupted at {}: {source}", path.display())]
    MetadataCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("lease io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl LeaseError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LeaseError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            LeaseError::Held { .. } => Transience::Retryable,
            LeaseError::MetadataCorrupt { .. } => Transience::Permanent,
            LeaseError::Io { .. } => Transience::Unknown,
            LeaseError::Backend(err) => err.transience(),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            LeaseError::Held { .. } | LeaseError::MetadataCorrupt { .. } => Effect::None,
            LeaseError::Io { .. } => Effect::Unknown,
            LeaseError::Backend(err) => err.effect(),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MirrorError {
    #[error("mirror for {asset} on {peer} is already running")]
    AlreadyRunning { peer: PeerAddress, asset: AssetKey },

    #[error("{asset} is already up to date: target {target} is not newer than {last_mirrored}")]
    AlreadyUpToDate {
        asset: AssetKey,
        last_mirrored: SnapshotEpoch,
        target: SnapshotEpoch,
    },

    #[error("snapshot {snapshot} of {asset} does not exist")]
    SnapshotMissing {
        asset: AssetKey,
        snapshot: SnapshotEpoch,
    },

    #[error("{asset} has no snapshots")]
    NoSnapshots { asset: AssetKey },

    #[error("expected exactly one target for volume {volume} on {peer}, found {found}")]
    TargetCount {
        peer: PeerAddress,
        volume: VolumeGuid,
        found: usize,
    },

    #[error("expected exactly one partition on {}, found {found}", image.display())]
    PartitionCount { image: PathBuf, found: usize },

    #[error("expected exactly one block device for target {target}, found {found}")]
    BlockDeviceCount { target: String, found: usize },

    #[error("partition geometry of {} overflows: start {start_sector}, sectors {sectors}, sector size {sector_size}", image.display())]
    GeometryOverflow {
        image: PathBuf,
        start_sector: u64,
        sectors: u64,
        sector_size: u64,
    },

    #[error("mirror job {label} did not start after {attempts} checks")]
    JobNotStarted { label: JobLabel, attempts: u32 },

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl MirrorError {
    pub fn transience(&self) -> Transience {
        match self {
            MirrorError::AlreadyRunning { .. } | MirrorError::JobNotStarted { .. } => {
                Transience::Retryable
            }
            MirrorError::Lease(err) => err.transience(),
            MirrorError::Backend(err) => err.transience(),
            MirrorError::Core(err) => err.transience(),
            _ => Transience::Permanent,
        }
    }

    /// Preconditions fail before any side effect; failures after login undo
    /// the login, which may itself fail.
    pub fn effect(&self) -> Effect {
        match self {
            MirrorError::Lease(err) => err.effect(),
            MirrorError::Backend(err) => err.effect(),
            MirrorError::Core(err) => err.effect(),
            MirrorError::BlockDeviceCount { .. } | MirrorError::JobNotStarted { .. } => {
                Effect::Unknown
            }
            _ => Effect::None,
        }
    }
}
