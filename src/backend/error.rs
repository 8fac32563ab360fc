//! Collaborator failures.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::error::{Effect, Transience};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{program}` exited with {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unexpected output from `{program}`: {reason}")]
    Parse { program: String, reason: String },

    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    #[error("{what} already exists: {name}")]
    AlreadyExists { what: &'static str, name: String },

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("restore ledger corrupt at {}: {source}", path.display())]
    LedgerCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{service} refused: {reason}")]
    Refused {
        service: &'static str,
        reason: String,
    },
}

impl BackendError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BackendError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        BackendError::NotFound {
            what,
            name: name.into(),
        }
    }

    /// Teardown treats an already-absent resource as done.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }

    pub fn transience(&self) -> Transience {
        match self {
            BackendError::Spawn { .. }
            | BackendError::Parse { .. }
            | BackendError::NotFound { .. }
            | BackendError::AlreadyExists { .. }
            | BackendError::LedgerCorrupt { .. }
            | BackendError::Refused { .. } => Transience::Permanent,
            BackendError::CommandFailed { .. } => Transience::Unknown,
            BackendError::Io { source, .. } => match source.kind() {
                io::ErrorKind::PermissionDenied => Transience::Permanent,
                _ => Transience::Retryable,
            },
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            BackendError::Spawn { .. }
            | BackendError::NotFound { .. }
            | BackendError::AlreadyExists { .. }
            | BackendError::Refused { .. } => Effect::None,
            BackendError::Parse { .. }
            | BackendError::CommandFailed { .. }
            | BackendError::Io { .. }
            | BackendError::LedgerCorrupt { .. } => Effect::Unknown,
        }
    }
}
