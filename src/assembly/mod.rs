//! Restore target assembly.
//!
//! unseal -> clone -> attach loops -> export target -> hide files -> save
//! restore, run as one [`Transaction`]: either every artifact exists
//! afterwards or none does.

mod context;
mod error;
mod stages;

use std::path::PathBuf;
use std::sync::Arc;

pub use context::RestoreContext;
pub use error::AssemblyError;
pub use stages::{
    AssemblyStage, AttachLoopsStage, CreateCloneStage, CreateMercuryTargetStage, HideFilesStage,
    SaveRestoreStage, UnsealAssetStage,
};

use crate::backend::{
    BackendError, ChapSecret, EncryptionService, ExportTargets, FileExclusions, LoopDevices,
    Passphrase, RestoreLedger, StorageBackend, TargetName,
};
use crate::config::{ExportConfig, StorageConfig};
use crate::core::{Asset, CloneSpec, Restore, RestoreKey};
use crate::paths::{self, StateDir};
use crate::transaction::Transaction;

/// Collaborators the pipeline drives.
#[derive(Clone)]
pub struct AssemblyBackends {
    pub storage: Arc<dyn StorageBackend>,
    pub loops: Arc<dyn LoopDevices>,
    pub exports: Arc<dyn ExportTargets>,
    pub encryption: Arc<dyn EncryptionService>,
    pub exclusions: Arc<dyn FileExclusions>,
    pub ledger: Arc<dyn RestoreLedger>,
}

/// What a successful assembly hands back to the caller.
#[derive(Debug, Clone)]
pub struct AssembledRestore {
    pub restore: Restore,
    pub target: TargetName,
    pub secret: ChapSecret,
    pub luns: Vec<PathBuf>,
}

pub struct RestoreAssembler {
    backends: AssemblyBackends,
    storage: StorageConfig,
    export: ExportConfig,
    state_dir: StateDir,
}

impl RestoreAssembler {
    pub fn new(
        backends: AssemblyBackends,
        storage: StorageConfig,
        export: ExportConfig,
        state_dir: StateDir,
    ) -> Self {
        Self {
            backends,
            storage,
            export,
            state_dir,
        }
    }

    pub fn backends(&self) -> &AssemblyBackends {
        &self.backends
    }

    fn stages(&self) -> Vec<AssemblyStage<'_>> {
        let b = &self.backends;
        vec![
            AssemblyStage::UnsealAsset(UnsealAssetStage::new(b.encryption.as_ref())),
            AssemblyStage::CreateClone(CreateCloneStage::new(b.storage.as_ref(), &self.state_dir)),
            AssemblyStage::AttachLoops(AttachLoopsStage::new(b.loops.as_ref(), &self.storage)),
            AssemblyStage::CreateMercuryTarget(CreateMercuryTargetStage::new(
                b.exports.as_ref(),
                &self.export,
            )),
            AssemblyStage::HideFiles(HideFilesStage::new(b.exclusions.as_ref())),
            AssemblyStage::SaveRestore(SaveRestoreStage::new(b.ledger.as_ref())),
        ]
    }

    /// Assemble an exported restore target for `spec`.
    ///
    /// Callers serialize assemblies of the same clone spec.
    pub fn assemble(
        &self,
        asset: Asset,
        spec: CloneSpec,
        passphrase: Option<Passphrase>,
    ) -> Result<AssembledRestore, AssemblyError> {
        if &asset.key != spec.asset() {
            return Err(AssemblyError::AssetMismatch {
                given: asset.key,
                expected: spec.asset().clone(),
            });
        }
        let key = RestoreKey::for_clone(&spec);
        let existing = self
            .backends
            .ledger
            .find(&key)
            .map_err(AssemblyError::backend("precondition"))?;
        if existing.is_some() {
            return Err(AssemblyError::AlreadyAssembled(key));
        }

        let span = tracing::info_span!("assemble", clone = %spec);
        let _enter = span.enter();

        let mut ctx = RestoreContext::new(asset, spec, passphrase);
        Transaction::new("assemble", self.stages()).run(&mut ctx)?;

        let missing = |artifact| AssemblyError::MissingArtifact {
            stage: "assemble",
            artifact,
        };
        let restore = ctx.restore.ok_or_else(|| missing("restore"))?;
        let target = ctx.target_name.ok_or_else(|| missing("export target"))?;
        let secret = ctx.chap_secret.ok_or_else(|| missing("chap secret"))?;
        Ok(AssembledRestore {
            restore,
            target,
            secret,
            luns: ctx.luns,
        })
    }

    /// Remove every artifact of an assembled restore. Absent artifacts are
    /// skipped, so repeating a teardown is harmless.
    pub fn teardown(&self, spec: &CloneSpec) -> Result<(), AssemblyError> {
        let span = tracing::info_span!("teardown", clone = %spec);
        let _enter = span.enter();

        let key = RestoreKey::for_clone(spec);
        let ledger = self.backends.ledger.as_ref();
        let restore = ledger
            .find(&key)
            .map_err(AssemblyError::backend("teardown"))?;
        let target = match restore {
            Some(restore) => TargetName::new(restore.options.export_target)?,
            None => TargetName::for_restore(&self.export.iqn_prefix, spec)?,
        };

        tolerate_absent(self.backends.exports.delete_target(&target))
            .map_err(AssemblyError::backend(CreateMercuryTargetStage::NAME))?;

        let mount_point = self.backends.storage.clone_mount_point(spec);
        let detached = self
            .backends
            .loops
            .detach_all_under(&mount_point)
            .map_err(AssemblyError::backend(AttachLoopsStage::NAME))?;

        let removed = ledger
            .remove(&key)
            .map_err(AssemblyError::backend(SaveRestoreStage::NAME))?;

        tolerate_absent(self.backends.storage.destroy_clone(spec))
            .map_err(AssemblyError::backend(CreateCloneStage::NAME))?;

        let stamp = self.state_dir.clone_timestamp_path(spec);
        paths::remove_if_exists(&stamp).map_err(|err| {
            AssemblyError::backend(CreateCloneStage::NAME)(BackendError::io(&stamp, err))
        })?;

        tracing::info!(detached, restore_removed = removed, "restore torn down");
        Ok(())
    }
}

fn tolerate_absent(result: Result<(), BackendError>) -> Result<(), BackendError> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}
