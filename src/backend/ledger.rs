//! Durable restore records.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::error::BackendError;
use crate::core::{Restore, RestoreKey};
use crate::paths;

pub trait RestoreLedger: Send + Sync {
    fn find(&self, key: &RestoreKey) -> Result<Option<Restore>, BackendError>;

    /// `AlreadyExists` when a record with the same key is present.
    fn add(&self, restore: Restore) -> Result<(), BackendError>;

    /// Returns whether a record was removed.
    fn remove(&self, key: &RestoreKey) -> Result<bool, BackendError>;

    fn list(&self) -> Result<Vec<Restore>, BackendError>;
}

/// Restore records kept as one JSON array, rewritten atomically on change.
#[derive(Debug)]
pub struct JsonRestoreLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonRestoreLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Vec<Restore>, BackendError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(BackendError::io(&self.path, err)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|source| BackendError::LedgerCorrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn write(&self, restores: &[Restore]) -> Result<(), BackendError> {
        let bytes =
            serde_json::to_vec_pretty(restores).map_err(|source| BackendError::LedgerCorrupt {
                path: self.path.clone(),
                source,
            })?;
        paths::atomic_write(&self.path, &bytes).map_err(|err| BackendError::io(&self.path, err))
    }
}

impl RestoreLedger for JsonRestoreLedger {
    fn find(&self, key: &RestoreKey) -> Result<Option<Restore>, BackendError> {
        Ok(self.read()?.into_iter().find(|restore| &restore.key() == key))
    }

    fn add(&self, restore: Restore) -> Result<(), BackendError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut restores = self.read()?;
        let key = restore.key();
        if restores.iter().any(|existing| existing.key() == key) {
            return Err(BackendError::AlreadyExists {
                what: "restore",
                name: key.to_string(),
            });
        }
        restores.push(restore);
        restores.sort_by_key(Restore::key);
        self.write(&restores)
    }

    fn remove(&self, key: &RestoreKey) -> Result<bool, BackendError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut restores = self.read()?;
        let before = restores.len();
        restores.retain(|restore| &restore.key() != key);
        if restores.len() == before {
            return Ok(false);
        }
        self.write(&restores)?;
        Ok(true)
    }

    fn list(&self) -> Result<Vec<Restore>, BackendError> {
        self.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use crate::core::{AssetKey, CloneSuffix, RestoreOptions, RestoreType, SnapshotEpoch, WallClock};

    fn restore(asset: &str, snapshot: u64, suffix: CloneSuffix) -> Restore {
        Restore {
            asset: AssetKey::new(asset).unwrap(),
            snapshot: SnapshotEpoch(snapshot),
            restore_type: if suffix.as_str() == CloneSuffix::DIFFERENTIAL_ROLLBACK {
                RestoreType::DifferentialRollback
            } else {
                RestoreType::Bmr
            },
            created_at: WallClock(1),
            options: RestoreOptions {
                export_target: "iqn.test:t".into(),
                clone_suffix: suffix,
                extra: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn add_find_remove() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JsonRestoreLedger::new(dir.path().join("restores.json"));
        assert!(ledger.list().unwrap().is_empty());

        let a = restore("A1", 1000, CloneSuffix::bmr());
        let b = restore("A1", 1000, CloneSuffix::differential_rollback());
        ledger.add(a.clone()).unwrap();
        ledger.add(b.clone()).unwrap();
        assert_eq!(ledger.find(&a.key()).unwrap(), Some(a.clone()));
        assert_eq!(ledger.list().unwrap().len(), 2);

        assert!(ledger.remove(&a.key()).unwrap());
        assert!(!ledger.remove(&a.key()).unwrap());
        assert_eq!(ledger.list().unwrap(), vec![b]);
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JsonRestoreLedger::new(dir.path().join("restores.json"));
        ledger.add(restore("A1", 1000, CloneSuffix::bmr())).unwrap();
        let err = ledger
            .add(restore("A1", 1000, CloneSuffix::bmr()))
            .unwrap_err();
        assert!(matches!(err, BackendError::AlreadyExists { .. }));
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restores.json");
        fs::write(&path, b"{not json").unwrap();
        let ledger = JsonRestoreLedger::new(&path);
        assert!(matches!(
            ledger.list().unwrap_err(),
            BackendError::LedgerCorrupt { .. }
        ));
    }
}
