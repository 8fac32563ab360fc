//! Wiring of the command-backed collaborators into the three services.

use std::sync::Arc;

use crate::assembly::{AssemblyBackends, RestoreAssembler};
use crate::backend::{
    EncryptionService, ExportTargets, FileExclusions, IscsiadmInitiator, JobRunner,
    JsonRestoreLedger, LosetupLoops, ProcessJobRunner, SfdiskInspector, StorageBackend,
    ZfsStorage,
};
use crate::cleaner::BmrCleaner;
use crate::config::Config;
use crate::mirror::{MirrorBackends, MirrorService};
use crate::paths::StateDir;
use crate::telemetry::{self, TelemetryGuard};

/// Vendor components with no command-line tooling to drive.
pub struct VendorServices {
    pub exports: Arc<dyn ExportTargets>,
    pub encryption: Arc<dyn EncryptionService>,
    pub exclusions: Arc<dyn FileExclusions>,
}

pub struct Appliance {
    pub assembler: Arc<RestoreAssembler>,
    pub mirrors: Arc<MirrorService>,
    pub cleaner: BmrCleaner,
}

impl Appliance {
    /// Process entry point: install logging, then wire the services against
    /// `state_dir`. Logs flush until the returned guard is dropped.
    pub fn start(
        config: &Config,
        state_dir: StateDir,
        vendor: VendorServices,
    ) -> (Self, TelemetryGuard) {
        let telemetry = telemetry::init(&config.logging, &state_dir);
        (Self::new(config, state_dir, vendor), telemetry)
    }

    pub fn new(config: &Config, state_dir: StateDir, vendor: VendorServices) -> Self {
        let storage: Arc<dyn StorageBackend> = Arc::new(ZfsStorage::new(config.storage.clone()));
        let jobs: Arc<dyn JobRunner> = Arc::new(ProcessJobRunner::new(state_dir.clone()));
        let assembler = Arc::new(RestoreAssembler::new(
            AssemblyBackends {
                storage: storage.clone(),
                loops: Arc::new(LosetupLoops::default()),
                exports: vendor.exports,
                encryption: vendor.encryption,
                exclusions: vendor.exclusions,
                ledger: Arc::new(JsonRestoreLedger::new(state_dir.restore_ledger_path())),
            },
            config.storage.clone(),
            config.export.clone(),
            state_dir.clone(),
        ));
        let mirrors = Arc::new(MirrorService::new(
            MirrorBackends {
                initiator: Arc::new(IscsiadmInitiator::default()),
                storage,
                partitions: Arc::new(SfdiskInspector::default()),
                jobs,
            },
            config.mirror.clone(),
            config.storage.clone(),
            state_dir.clone(),
        ));
        let cleaner = BmrCleaner::new(
            assembler.clone(),
            mirrors.clone(),
            config.cleaner.clone(),
            state_dir,
        );
        tracing::debug!(pool = %config.storage.pool, "appliance services wired");
        Self {
            assembler,
            mirrors,
            cleaner,
        }
    }
}
