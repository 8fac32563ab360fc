//! Core capability errors (identifier parsing and validation).
//!
//! These are bounded and stable: core errors represent refusal states on
//! caller input, not collaborator failures.

use thiserror::Error;

use crate::error::{Effect, Transience};

/// Invalid identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("asset key `{raw}` is invalid: {reason}")]
    Asset { raw: String, reason: String },
    #[error("volume guid `{raw}` is invalid: {reason}")]
    Volume { raw: String, reason: String },
    #[error("peer address `{raw}` is invalid: {reason}")]
    Peer { raw: String, reason: String },
    #[error("clone suffix `{raw}` is invalid: {reason}")]
    Suffix { raw: String, reason: String },
    #[error("clone name `{raw}` is invalid: {reason}")]
    CloneName { raw: String, reason: String },
    #[error("target name `{raw}` is invalid: {reason}")]
    Target { raw: String, reason: String },
    #[error("job label `{raw}` is invalid: {reason}")]
    JobLabel { raw: String, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),

    #[error("unknown restore type `{0}`")]
    UnknownRestoreType(String),
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
