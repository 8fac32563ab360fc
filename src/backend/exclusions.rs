//! File-exclusion rules applied to a mounted clone before it is exported.

use std::path::Path;

use super::error::BackendError;
use crate::core::Asset;

pub trait FileExclusions: Send + Sync {
    fn apply(&self, asset: &Asset, mount_point: &Path) -> Result<(), BackendError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoExclusions;

impl FileExclusions for NoExclusions {
    fn apply(&self, _asset: &Asset, _mount_point: &Path) -> Result<(), BackendError> {
        Ok(())
    }
}
