//! Block-export targets (the server side of the storage protocol).

use std::fmt;
use std::path::PathBuf;

use rand::Rng;
use rand::distributions::Alphanumeric;

use super::error::BackendError;
use crate::core::{CloneSpec, CoreError, InvalidId};

/// Export target name (an IQN).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TargetName(String);

impl TargetName {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        let valid = !s.is_empty()
            && s.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | ':')
            });
        if !valid {
            return Err(InvalidId::Target {
                raw: s,
                reason: "must be lowercase ascii alphanumeric, '.', '-' or ':'".into(),
            }
            .into());
        }
        Ok(Self(s))
    }

    /// `<prefix>:<asset>-<snapshot>-<restore type>`. Asset bytes outside
    /// `[a-z0-9]` are written as `.xx`, so distinct assets never share a name.
    pub fn for_restore(prefix: &str, spec: &CloneSpec) -> Result<Self, CoreError> {
        let mut asset = String::new();
        for byte in spec.asset().as_str().bytes() {
            if byte.is_ascii_lowercase() || byte.is_ascii_digit() {
                asset.push(char::from(byte));
            } else {
                asset.push_str(&format!(".{byte:02x}"));
            }
        }
        Self::new(format!(
            "{}:{}-{}-{}",
            prefix.to_ascii_lowercase(),
            asset,
            spec.snapshot(),
            spec.restore_type().as_str()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TargetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TargetName({:?})", self.0)
    }
}

impl fmt::Display for TargetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// CHAP password protecting an export target. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ChapSecret(String);

impl ChapSecret {
    pub fn generate(len: usize) -> Self {
        let secret = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len.max(12))
            .map(char::from)
            .collect();
        Self(secret)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ChapSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChapSecret(<redacted>)")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportTarget {
    pub name: TargetName,
    pub luns: Vec<PathBuf>,
}

pub trait ExportTargets: Send + Sync {
    /// Create a target exposing `luns` in order, protected by `secret`.
    fn create_target(
        &self,
        name: &TargetName,
        luns: &[PathBuf],
        secret: &ChapSecret,
    ) -> Result<ExportTarget, BackendError>;

    /// Delete the target. `NotFound` when it does not exist.
    fn delete_target(&self, name: &TargetName) -> Result<(), BackendError>;

    fn target_exists(&self, name: &TargetName) -> Result<bool, BackendError>;
}
