#![forbid(unsafe_code)]

pub mod appliance;
pub mod assembly;
pub mod backend;
pub mod cleaner;
pub mod config;
pub mod core;
pub mod error;
pub mod mirror;
pub mod paths;
pub mod telemetry;
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;
pub mod transaction;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::appliance::{Appliance, VendorServices};
pub use crate::assembly::{AssembledRestore, AssemblyBackends, AssemblyError, RestoreAssembler};
pub use crate::cleaner::{BmrCleaner, DiscoveryReport, SweepReport};
pub use crate::core::{
    Asset, AssetKey, CloneSpec, CloneSuffix, PeerAddress, Restore, RestoreKey, RestoreType,
    SnapshotEpoch, VolumeGuid, WallClock,
};
pub use crate::mirror::{
    MirrorBackends, MirrorError, MirrorOutcome, MirrorRequest, MirrorService, MirrorStarted,
    MirrorStatus,
};
pub use crate::transaction::{Stage, Transaction};
