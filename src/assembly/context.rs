use std::path::PathBuf;

use crate::backend::{ChapSecret, Passphrase, TargetName};
use crate::core::{Asset, CloneSpec, Restore};

/// State threaded through one assembly run.
///
/// Owned by the run and lent to each stage as `&mut`; stages fill in the
/// artifact fields as they commit and clear them on rollback.
#[derive(Debug)]
pub struct RestoreContext {
    pub asset: Asset,
    pub clone_spec: CloneSpec,
    pub passphrase: Option<Passphrase>,
    /// Set by the clone stage.
    pub mount_point: Option<PathBuf>,
    /// Loop devices attached for the clone's images.
    pub loop_devices: Vec<PathBuf>,
    /// One exported block device per volume, in volume order.
    pub luns: Vec<PathBuf>,
    pub target_name: Option<TargetName>,
    pub chap_secret: Option<ChapSecret>,
    pub restore: Option<Restore>,
}

impl RestoreContext {
    pub fn new(asset: Asset, clone_spec: CloneSpec, passphrase: Option<Passphrase>) -> Self {
        Self {
            asset,
            clone_spec,
            passphrase,
            mount_point: None,
            loop_devices: Vec::new(),
            luns: Vec::new(),
            target_name: None,
            chap_secret: None,
            restore: None,
        }
    }
}
