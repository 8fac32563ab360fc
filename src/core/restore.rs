//! Durable restore records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::clone_spec::{CloneSpec, CloneSuffix};
use super::error::CoreError;
use super::identity::{AssetKey, SnapshotEpoch};
use super::time::WallClock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreType {
    Bmr,
    DifferentialRollback,
}

impl RestoreType {
    pub fn as_str(self) -> &'static str {
        match self {
            RestoreType::Bmr => "bmr",
            RestoreType::DifferentialRollback => "differential-rollback",
        }
    }
}

impl fmt::Display for RestoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestoreType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bmr" => Ok(RestoreType::Bmr),
            "differential-rollback" => Ok(RestoreType::DifferentialRollback),
            other => Err(CoreError::UnknownRestoreType(other.to_string())),
        }
    }
}

/// At most one restore exists per key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RestoreKey {
    pub asset: AssetKey,
    pub snapshot: SnapshotEpoch,
    pub restore_type: RestoreType,
}

impl RestoreKey {
    pub fn for_clone(spec: &CloneSpec) -> Self {
        Self {
            asset: spec.asset().clone(),
            snapshot: spec.snapshot(),
            restore_type: spec.restore_type(),
        }
    }
}

impl fmt::Display for RestoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.asset, self.snapshot, self.restore_type)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOptions {
    /// Name of the block-export target serving this restore.
    pub export_target: String,
    /// Suffix of the clone backing the export.
    pub clone_suffix: CloneSuffix,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restore {
    pub asset: AssetKey,
    pub snapshot: SnapshotEpoch,
    pub restore_type: RestoreType,
    pub created_at: WallClock,
    pub options: RestoreOptions,
}

impl Restore {
    pub fn key(&self) -> RestoreKey {
        RestoreKey {
            asset: self.asset.clone(),
            snapshot: self.snapshot,
            restore_type: self.restore_type,
        }
    }

    /// The clone this restore is served from.
    pub fn clone_spec(&self) -> CloneSpec {
        CloneSpec::new(
            self.asset.clone(),
            self.snapshot,
            self.options.clone_suffix.clone(),
        )
    }
}
