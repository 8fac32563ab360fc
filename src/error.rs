use thiserror::Error;

use crate::assembly::AssemblyError;
use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::core::CoreError;
use crate::mirror::{LeaseError, MirrorError};

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred and were not undone.
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the capability errors; match on those for detail.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Mirror(#[from] MirrorError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(e) => e.transience(),
            Error::Backend(e) => e.transience(),
            Error::Assembly(e) => e.transience(),
            Error::Mirror(e) => e.transience(),
            Error::Lease(e) => e.transience(),
            Error::Config(e) => e.transience(),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Core(e) => e.effect(),
            Error::Backend(e) => e.effect(),
            Error::Assembly(e) => e.effect(),
            Error::Mirror(e) => e.effect(),
            Error::Lease(e) => e.effect(),
            Error::Config(e) => e.effect(),
        }
    }
}
