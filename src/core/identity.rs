//! Identifiers for protected assets, snapshots, volumes and protocol peers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{CoreError, InvalidId};

/// Asset key - the identifier of a protected system.
///
/// Used verbatim in dataset names and file names, so path separators,
/// whitespace and the snapshot delimiter `@` are refused.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetKey(String);

impl AssetKey {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        let reason = if s.is_empty() {
            Some("empty")
        } else if s.contains(['/', '@']) {
            Some("contains '/' or '@'")
        } else if s.chars().any(char::is_whitespace) {
            Some("contains whitespace")
        } else if s.starts_with('.') {
            Some("starts with '.'")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(InvalidId::Asset {
                raw: s,
                reason: reason.into(),
            }
            .into()),
            None => Ok(Self(s)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Form usable inside a single file name component; never contains `-`.
    pub fn file_component(&self) -> String {
        escape_component(&self.0)
    }
}

impl TryFrom<String> for AssetKey {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AssetKey> for String {
    fn from(value: AssetKey) -> Self {
        value.0
    }
}

impl fmt::Debug for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetKey({:?})", self.0)
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot identifier: the epoch second the snapshot was taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotEpoch(pub u64);

impl SnapshotEpoch {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SnapshotEpoch {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(SnapshotEpoch)
    }
}

/// Volume identifier inside an asset (guid of the protected volume).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolumeGuid(String);

impl VolumeGuid {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.is_empty() {
            return Err(InvalidId::Volume {
                raw: s,
                reason: "empty".into(),
            }
            .into());
        }
        if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(InvalidId::Volume {
                raw: s,
                reason: "must be ascii alphanumeric or '-'".into(),
            }
            .into());
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for VolumeGuid {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VolumeGuid> for String {
    fn from(value: VolumeGuid) -> Self {
        value.0
    }
}

impl fmt::Debug for VolumeGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeGuid({:?})", self.0)
    }
}

impl fmt::Display for VolumeGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network address of a block-export protocol peer (host or host:port).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.is_empty() || s.chars().any(char::is_whitespace) || s.contains('/') {
            return Err(InvalidId::Peer {
                raw: s,
                reason: "must be a non-empty host[:port] without whitespace".into(),
            }
            .into());
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Form usable inside a single file name component; never contains `-`.
    pub fn file_component(&self) -> String {
        escape_component(&self.0)
    }
}

/// Injective escape into `[A-Za-z0-9._]`: every other byte, `_` included,
/// becomes `_xx`. Joined parts can therefore be separated by `-`.
fn escape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'.' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("_{byte:02x}"));
        }
    }
    out
}

impl TryFrom<String> for PeerAddress {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerAddress> for String {
    fn from(value: PeerAddress) -> Self {
        value.0
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({:?})", self.0)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
