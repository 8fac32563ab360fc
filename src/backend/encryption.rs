//! Encryption key service consumed by unsealing.

use std::fmt;

use super::error::BackendError;
use crate::core::AssetKey;

/// Master-key passphrase supplied by the operator. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

pub trait EncryptionService: Send + Sync {
    fn is_encrypted(&self, asset: &AssetKey) -> Result<bool, BackendError>;

    fn is_master_key_loaded(&self, asset: &AssetKey) -> Result<bool, BackendError>;

    /// A temporary-access grant lets restores proceed without the passphrase.
    fn has_temporary_access(&self, asset: &AssetKey) -> Result<bool, BackendError>;

    /// `Refused` when the passphrase does not unseal the key.
    fn decrypt_master_key(
        &self,
        asset: &AssetKey,
        passphrase: &Passphrase,
    ) -> Result<(), BackendError>;
}

/// For appliances without at-rest encryption.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unencrypted;

impl EncryptionService for Unencrypted {
    fn is_encrypted(&self, _asset: &AssetKey) -> Result<bool, BackendError> {
        Ok(false)
    }

    fn is_master_key_loaded(&self, _asset: &AssetKey) -> Result<bool, BackendError> {
        Ok(true)
    }

    fn has_temporary_access(&self, _asset: &AssetKey) -> Result<bool, BackendError> {
        Ok(false)
    }

    fn decrypt_master_key(
        &self,
        _asset: &AssetKey,
        _passphrase: &Passphrase,
    ) -> Result<(), BackendError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passphrase_debug_is_redacted() {
        let pass = Passphrase::new("hunter2");
        assert_eq!(format!("{pass:?}"), "Passphrase(<redacted>)");
        assert_eq!(pass.expose(), "hunter2");
    }
}
