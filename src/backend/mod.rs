//! Collaborators consumed by assembly, mirroring and the sweep.
//!
//! Each collaborator is a trait; the command-backed adapters here drive the
//! standard Linux tooling. The export-target daemon and the encryption
//! service are vendor components and only have trait definitions.

pub mod command;
pub mod encryption;
pub mod error;
pub mod exclusions;
pub mod export;
pub mod initiator;
pub mod jobs;
pub mod ledger;
pub mod loops;
pub mod partition;
pub mod storage;

pub use encryption::{EncryptionService, Passphrase, Unencrypted};
pub use error::BackendError;
pub use exclusions::{FileExclusions, NoExclusions};
pub use export::{ChapSecret, ExportTarget, ExportTargets, TargetName};
pub use initiator::{DiscoveredTarget, Initiator, IscsiadmInitiator};
pub use jobs::{JobLabel, JobRunner, JobSpec, JobState, ProcessJobRunner};
pub use ledger::{JsonRestoreLedger, RestoreLedger};
pub use loops::{LoopDevice, LoopDevices, LosetupLoops};
pub use partition::{PartitionEntry, PartitionInspector, PartitionTable, SfdiskInspector};
pub use storage::{StorageBackend, ZfsStorage};
