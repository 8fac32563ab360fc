//! Core value types for restore orchestration.
//!
//! Module hierarchy follows type dependency order:
//! - time: WallClock
//! - identity: AssetKey, SnapshotEpoch, VolumeGuid, PeerAddress
//! - restore: RestoreType, RestoreKey, Restore
//! - clone_spec: CloneSuffix, CloneSpec
//! - asset: Asset

pub mod asset;
pub mod clone_spec;
pub mod error;
pub mod identity;
pub mod restore;
pub mod time;

pub use asset::Asset;
pub use clone_spec::{CloneSpec, CloneSuffix};
pub use error::{CoreError, InvalidId};
pub use identity::{AssetKey, PeerAddress, SnapshotEpoch, VolumeGuid};
pub use restore::{Restore, RestoreKey, RestoreOptions, RestoreType};
pub use time::WallClock;
