//! Restore target identity: which snapshot of which asset, cloned for what.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::{CoreError, InvalidId};
use super::identity::{AssetKey, SnapshotEpoch};
use super::restore::RestoreType;

/// Purpose tag appended to clone names.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CloneSuffix(String);

impl CloneSuffix {
    pub const BMR: &'static str = "bmr";
    pub const DIFFERENTIAL_ROLLBACK: &'static str = "differential-rollback";

    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        let valid = !s.is_empty()
            && !s.starts_with('-')
            && s
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid {
            return Err(InvalidId::Suffix {
                raw: s,
                reason: "must be non-empty lowercase ascii alphanumeric or '-'".into(),
            }
            .into());
        }
        Ok(Self(s))
    }

    pub fn bmr() -> Self {
        Self(Self::BMR.to_string())
    }

    pub fn differential_rollback() -> Self {
        Self(Self::DIFFERENTIAL_ROLLBACK.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Suffixes whose clones are reclaimable by the stale BMR sweep.
    pub fn is_bmr_artifact(&self) -> bool {
        matches!(self.0.as_str(), Self::BMR | Self::DIFFERENTIAL_ROLLBACK)
    }
}

impl TryFrom<String> for CloneSuffix {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CloneSuffix> for String {
    fn from(value: CloneSuffix) -> Self {
        value.0
    }
}

impl fmt::Debug for CloneSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CloneSuffix({:?})", self.0)
    }
}

impl fmt::Display for CloneSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a restore target. Immutable; equality is by all three fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CloneSpec {
    asset: AssetKey,
    snapshot: SnapshotEpoch,
    suffix: CloneSuffix,
}

impl CloneSpec {
    pub fn new(asset: AssetKey, snapshot: SnapshotEpoch, suffix: CloneSuffix) -> Self {
        Self {
            asset,
            snapshot,
            suffix,
        }
    }

    pub fn asset(&self) -> &AssetKey {
        &self.asset
    }

    pub fn snapshot(&self) -> SnapshotEpoch {
        self.snapshot
    }

    pub fn suffix(&self) -> &CloneSuffix {
        &self.suffix
    }

    /// `<asset>-<snapshot>-<suffix>`, shared by dataset and mount point.
    pub fn clone_name(&self) -> String {
        format!("{}-{}-{}", self.asset, self.snapshot, self.suffix)
    }

    pub fn dataset_name(&self, pool: &str) -> String {
        format!("{}/{}", pool.trim_end_matches('/'), self.clone_name())
    }

    pub fn mount_point(&self, mount_root: &Path) -> PathBuf {
        mount_root.join(self.clone_name())
    }

    /// Only the exact differential-rollback suffix selects that type.
    pub fn restore_type(&self) -> RestoreType {
        if self.suffix.as_str() == CloneSuffix::DIFFERENTIAL_ROLLBACK {
            RestoreType::DifferentialRollback
        } else {
            RestoreType::Bmr
        }
    }

    /// Parse a clone name produced by [`CloneSpec::clone_name`] for a known suffix.
    ///
    /// Asset keys may contain '-', so the suffix has to be supplied and the
    /// epoch is taken from the last remaining component.
    pub fn parse_clone_name(name: &str, suffix: &CloneSuffix) -> Result<Self, CoreError> {
        let invalid = |reason: &str| -> CoreError {
            InvalidId::CloneName {
                raw: name.to_string(),
                reason: reason.to_string(),
            }
            .into()
        };
        let head = name
            .strip_suffix(suffix.as_str())
            .and_then(|rest| rest.strip_suffix('-'))
            .ok_or_else(|| invalid("suffix does not match"))?;
        let (asset, epoch) = head
            .rsplit_once('-')
            .ok_or_else(|| invalid("missing snapshot component"))?;
        let snapshot = epoch
            .parse::<SnapshotEpoch>()
            .map_err(|_| invalid("snapshot component is not an epoch"))?;
        Ok(Self::new(AssetKey::new(asset)?, snapshot, suffix.clone()))
    }
}

impl fmt::Display for CloneSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.clone_name())
    }
}
