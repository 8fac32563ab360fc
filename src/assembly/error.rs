use thiserror::Error;

use crate::backend::BackendError;
use crate::core::{AssetKey, CoreError, RestoreKey, VolumeGuid};
use crate::error::{Effect, Transience};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AssemblyError {
    #[error("asset {asset} is sealed and no passphrase was supplied")]
    PassphraseRequired { asset: AssetKey },

    #[error("asset {asset} has no volumes to attach")]
    NoVolumes { asset: AssetKey },

    #[error("unexpected number of partitions on volume {volume}: found {found}, expected 1")]
    UnexpectedPartitionCount { volume: VolumeGuid, found: usize },

    #[error("asset {given} does not match clone asset {expected}")]
    AssetMismatch { given: AssetKey, expected: AssetKey },

    #[error("restore {0} already exists")]
    AlreadyAssembled(RestoreKey),

    #[error("{stage} ran before {artifact} was produced")]
    MissingArtifact {
        stage: &'static str,
        artifact: &'static str,
    },

    #[error("{stage}: {source}")]
    Backend {
        stage: &'static str,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl AssemblyError {
    pub(crate) fn backend(stage: &'static str) -> impl FnOnce(BackendError) -> Self {
        move |source| AssemblyError::Backend { stage, source }
    }

    pub fn transience(&self) -> Transience {
        match self {
            AssemblyError::Backend { source, .. } => source.transience(),
            AssemblyError::Core(err) => err.transience(),
            _ => Transience::Permanent,
        }
    }

    /// Stage failures are unwound before they surface, so only a failed
    /// rollback could leave effects behind; that is logged, not reported.
    pub fn effect(&self) -> Effect {
        match self {
            AssemblyError::Backend { source, .. } => match source.effect() {
                Effect::None => Effect::None,
                _ => Effect::Unknown,
            },
            _ => Effect::None,
        }
    }
}
