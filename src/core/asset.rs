//! Protected asset handle as seen by restore assembly.

use serde::{Deserialize, Serialize};

use super::identity::{AssetKey, VolumeGuid};

/// Minimal projection of asset metadata: which volumes have images.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub key: AssetKey,
    pub volumes: Vec<VolumeGuid>,
}

impl Asset {
    pub fn new(key: AssetKey, volumes: Vec<VolumeGuid>) -> Self {
        Self { key, volumes }
    }
}
