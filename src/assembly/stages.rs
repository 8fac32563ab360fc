//! The restore assembly stages, in pipeline order.

use std::collections::BTreeMap;
use std::path::PathBuf;

use super::context::RestoreContext;
use super::error::AssemblyError;
use crate::backend::{
    BackendError, ChapSecret, EncryptionService, ExportTargets, FileExclusions, LoopDevices,
    RestoreLedger, StorageBackend, TargetName,
};
use crate::config::{ExportConfig, StorageConfig};
use crate::core::{Restore, RestoreOptions, WallClock};
use crate::paths::{self, StateDir};
use crate::transaction::Stage;

fn require_mount_point(
    ctx: &RestoreContext,
    stage: &'static str,
) -> Result<PathBuf, AssemblyError> {
    ctx.mount_point
        .clone()
        .ok_or(AssemblyError::MissingArtifact {
            stage,
            artifact: "clone mount point",
        })
}

/// Loads the asset's master key when it is sealed.
///
/// Unsealing is never undone: a later failure leaves the key loaded.
pub struct UnsealAssetStage<'a> {
    encryption: &'a dyn EncryptionService,
}

impl<'a> UnsealAssetStage<'a> {
    pub const NAME: &'static str = "unseal-asset";

    pub fn new(encryption: &'a dyn EncryptionService) -> Self {
        Self { encryption }
    }
}

impl Stage<RestoreContext> for UnsealAssetStage<'_> {
    type Error = AssemblyError;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn commit(&mut self, ctx: &mut RestoreContext) -> Result<(), AssemblyError> {
        let asset = ctx.clone_spec.asset();
        let backend = |source| AssemblyError::Backend {
            stage: Self::NAME,
            source,
        };
        if !self.encryption.is_encrypted(asset).map_err(backend)? {
            return Ok(());
        }
        if self.encryption.is_master_key_loaded(asset).map_err(backend)?
            || self.encryption.has_temporary_access(asset).map_err(backend)?
        {
            tracing::debug!(%asset, "asset already accessible");
            return Ok(());
        }
        let passphrase = ctx
            .passphrase
            .as_ref()
            .ok_or_else(|| AssemblyError::PassphraseRequired {
                asset: asset.clone(),
            })?;
        self.encryption
            .decrypt_master_key(asset, passphrase)
            .map_err(backend)?;
        tracing::info!(%asset, "unsealed master key");
        Ok(())
    }
}

/// Writable clone of the snapshot plus its creation timestamp file.
pub struct CreateCloneStage<'a> {
    storage: &'a dyn StorageBackend,
    state_dir: &'a StateDir,
}

impl<'a> CreateCloneStage<'a> {
    pub const NAME: &'static str = "create-clone";

    pub fn new(storage: &'a dyn StorageBackend, state_dir: &'a StateDir) -> Self {
        Self { storage, state_dir }
    }
}

impl Stage<RestoreContext> for CreateCloneStage<'_> {
    type Error = AssemblyError;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn commit(&mut self, ctx: &mut RestoreContext) -> Result<(), AssemblyError> {
        let spec = &ctx.clone_spec;
        let mount_point = self
            .storage
            .create_clone(spec)
            .map_err(AssemblyError::backend(Self::NAME))?;

        let stamp = self.state_dir.clone_timestamp_path(spec);
        let created = WallClock::now();
        if let Err(err) = paths::atomic_write(&stamp, created.0.to_string().as_bytes()) {
            if let Err(destroy) = self.storage.destroy_clone(spec) {
                tracing::error!(clone = %spec, error = %destroy, "failed to destroy clone after timestamp failure");
            }
            return Err(AssemblyError::Backend {
                stage: Self::NAME,
                source: BackendError::io(&stamp, err),
            });
        }
        ctx.mount_point = Some(mount_point);
        Ok(())
    }

    fn rollback(&mut self, ctx: &mut RestoreContext) -> Result<(), AssemblyError> {
        let spec = &ctx.clone_spec;
        match self.storage.destroy_clone(spec) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                tracing::debug!(clone = %spec, "clone already absent");
            }
            Err(err) => return Err(AssemblyError::backend(Self::NAME)(err)),
        }
        let stamp = self.state_dir.clone_timestamp_path(spec);
        paths::remove_if_exists(&stamp)
            .map_err(|err| AssemblyError::backend(Self::NAME)(BackendError::io(&stamp, err)))?;
        ctx.mount_point = None;
        Ok(())
    }
}

/// One loop device per volume image; each image must hold exactly one
/// partition, which becomes the volume's LUN.
pub struct AttachLoopsStage<'a> {
    loops: &'a dyn LoopDevices,
    storage: &'a StorageConfig,
}

impl<'a> AttachLoopsStage<'a> {
    pub const NAME: &'static str = "attach-loops";

    pub fn new(loops: &'a dyn LoopDevices, storage: &'a StorageConfig) -> Self {
        Self { loops, storage }
    }

    fn detach_quietly(&self, devices: &[PathBuf]) {
        for device in devices.iter().rev() {
            if let Err(err) = self.loops.detach(device) {
                tracing::warn!(device = %device.display(), error = %err, "failed to detach loop");
            }
        }
    }
}

impl Stage<RestoreContext> for AttachLoopsStage<'_> {
    type Error = AssemblyError;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn commit(&mut self, ctx: &mut RestoreContext) -> Result<(), AssemblyError> {
        let mount_point = require_mount_point(ctx, Self::NAME)?;
        if ctx.asset.volumes.is_empty() {
            return Err(AssemblyError::NoVolumes {
                asset: ctx.asset.key.clone(),
            });
        }

        let mut attached = Vec::with_capacity(ctx.asset.volumes.len());
        let mut luns = Vec::with_capacity(ctx.asset.volumes.len());
        for volume in &ctx.asset.volumes {
            let image = mount_point.join(self.storage.image_file_name(volume));
            let device = match self.loops.attach(&image) {
                Ok(device) => device,
                Err(err) => {
                    self.detach_quietly(&attached);
                    return Err(AssemblyError::backend(Self::NAME)(err));
                }
            };
            attached.push(device.device.clone());
            let [partition] = device.partitions.as_slice() else {
                self.detach_quietly(&attached);
                return Err(AssemblyError::UnexpectedPartitionCount {
                    volume: volume.clone(),
                    found: device.partitions.len(),
                });
            };
            tracing::debug!(%volume, lun = %partition.display(), "attached volume");
            luns.push(partition.clone());
        }
        ctx.loop_devices = attached;
        ctx.luns = luns;
        Ok(())
    }

    fn rollback(&mut self, ctx: &mut RestoreContext) -> Result<(), AssemblyError> {
        let mount_point = require_mount_point(ctx, Self::NAME)?;
        let detached = self
            .loops
            .detach_all_under(&mount_point)
            .map_err(AssemblyError::backend(Self::NAME))?;
        tracing::debug!(detached, mount_point = %mount_point.display(), "detached loops");
        ctx.loop_devices.clear();
        ctx.luns.clear();
        Ok(())
    }
}

/// Export target over the LUNs, protected by a fresh CHAP secret.
pub struct CreateMercuryTargetStage<'a> {
    exports: &'a dyn ExportTargets,
    config: &'a ExportConfig,
}

impl<'a> CreateMercuryTargetStage<'a> {
    pub const NAME: &'static str = "create-mercury-target";

    pub fn new(exports: &'a dyn ExportTargets, config: &'a ExportConfig) -> Self {
        Self { exports, config }
    }
}

impl Stage<RestoreContext> for CreateMercuryTargetStage<'_> {
    type Error = AssemblyError;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn commit(&mut self, ctx: &mut RestoreContext) -> Result<(), AssemblyError> {
        if ctx.luns.is_empty() {
            return Err(AssemblyError::MissingArtifact {
                stage: Self::NAME,
                artifact: "luns",
            });
        }
        let name = TargetName::for_restore(&self.config.iqn_prefix, &ctx.clone_spec)?;
        let secret = ChapSecret::generate(self.config.password_len);
        let target = self
            .exports
            .create_target(&name, &ctx.luns, &secret)
            .map_err(AssemblyError::backend(Self::NAME))?;
        tracing::info!(target = %target.name, luns = target.luns.len(), "created export target");
        ctx.target_name = Some(target.name);
        ctx.chap_secret = Some(secret);
        Ok(())
    }

    fn rollback(&mut self, ctx: &mut RestoreContext) -> Result<(), AssemblyError> {
        let Some(name) = ctx.target_name.clone() else {
            return Ok(());
        };
        match self.exports.delete_target(&name) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                tracing::debug!(target = %name, "export target already absent");
            }
            Err(err) => return Err(AssemblyError::backend(Self::NAME)(err)),
        }
        ctx.target_name = None;
        ctx.chap_secret = None;
        Ok(())
    }
}

/// Best-effort exclusion rules; failures are logged and swallowed.
pub struct HideFilesStage<'a> {
    exclusions: &'a dyn FileExclusions,
}

impl<'a> HideFilesStage<'a> {
    pub const NAME: &'static str = "hide-files";

    pub fn new(exclusions: &'a dyn FileExclusions) -> Self {
        Self { exclusions }
    }
}

impl Stage<RestoreContext> for HideFilesStage<'_> {
    type Error = AssemblyError;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn commit(&mut self, ctx: &mut RestoreContext) -> Result<(), AssemblyError> {
        let mount_point = require_mount_point(ctx, Self::NAME)?;
        if let Err(err) = self.exclusions.apply(&ctx.asset, &mount_point) {
            tracing::warn!(
                clone = %ctx.clone_spec,
                error = %err,
                "file exclusions failed; continuing"
            );
        }
        Ok(())
    }
}

/// Durable restore record; its presence marks the restore as live.
pub struct SaveRestoreStage<'a> {
    ledger: &'a dyn RestoreLedger,
}

impl<'a> SaveRestoreStage<'a> {
    pub const NAME: &'static str = "save-restore";

    pub fn new(ledger: &'a dyn RestoreLedger) -> Self {
        Self { ledger }
    }
}

impl Stage<RestoreContext> for SaveRestoreStage<'_> {
    type Error = AssemblyError;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn commit(&mut self, ctx: &mut RestoreContext) -> Result<(), AssemblyError> {
        let target = ctx
            .target_name
            .as_ref()
            .ok_or(AssemblyError::MissingArtifact {
                stage: Self::NAME,
                artifact: "export target",
            })?;
        let spec = &ctx.clone_spec;
        let restore = Restore {
            asset: spec.asset().clone(),
            snapshot: spec.snapshot(),
            restore_type: spec.restore_type(),
            created_at: WallClock::now(),
            options: RestoreOptions {
                export_target: target.to_string(),
                clone_suffix: spec.suffix().clone(),
                extra: BTreeMap::new(),
            },
        };
        self.ledger
            .add(restore.clone())
            .map_err(AssemblyError::backend(Self::NAME))?;
        tracing::info!(restore = %restore.key(), "saved restore");
        ctx.restore = Some(restore);
        Ok(())
    }

    fn rollback(&mut self, ctx: &mut RestoreContext) -> Result<(), AssemblyError> {
        if let Some(restore) = &ctx.restore {
            self.ledger
                .remove(&restore.key())
                .map_err(AssemblyError::backend(Self::NAME))?;
        }
        ctx.restore = None;
        Ok(())
    }
}

/// The closed set of assembly stages.
pub enum AssemblyStage<'a> {
    UnsealAsset(UnsealAssetStage<'a>),
    CreateClone(CreateCloneStage<'a>),
    AttachLoops(AttachLoopsStage<'a>),
    CreateMercuryTarget(CreateMercuryTargetStage<'a>),
    HideFiles(HideFilesStage<'a>),
    SaveRestore(SaveRestoreStage<'a>),
}

impl AssemblyStage<'_> {
    fn as_stage(&mut self) -> &mut dyn Stage<RestoreContext, Error = AssemblyError> {
        match self {
            AssemblyStage::UnsealAsset(stage) => stage,
            AssemblyStage::CreateClone(stage) => stage,
            AssemblyStage::AttachLoops(stage) => stage,
            AssemblyStage::CreateMercuryTarget(stage) => stage,
            AssemblyStage::HideFiles(stage) => stage,
            AssemblyStage::SaveRestore(stage) => stage,
        }
    }
}

impl Stage<RestoreContext> for AssemblyStage<'_> {
    type Error = AssemblyError;

    fn name(&self) -> &'static str {
        match self {
            AssemblyStage::UnsealAsset(_) => UnsealAssetStage::NAME,
            AssemblyStage::CreateClone(_) => CreateCloneStage::NAME,
            AssemblyStage::AttachLoops(_) => AttachLoopsStage::NAME,
            AssemblyStage::CreateMercuryTarget(_) => CreateMercuryTargetStage::NAME,
            AssemblyStage::HideFiles(_) => HideFilesStage::NAME,
            AssemblyStage::SaveRestore(_) => SaveRestoreStage::NAME,
        }
    }

    fn commit(&mut self, ctx: &mut RestoreContext) -> Result<(), AssemblyError> {
        self.as_stage().commit(ctx)
    }

    fn rollback(&mut self, ctx: &mut RestoreContext) -> Result<(), AssemblyError> {
        self.as_stage().rollback(ctx)
    }

    fn cleanup(&mut self, ctx: &mut RestoreContext) -> Result<(), AssemblyError> {
        self.as_stage().cleanup(ctx)
    }
}
