//! In-memory collaborators for tests.
//!
//! Every fake records its calls into one shared [`Journal`] so tests can
//! assert cross-collaborator ordering (commit order, rollback order), and
//! every fake consults one shared [`Faults`] set so any operation can be made
//! to fail by name.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::assembly::{AssemblyBackends, RestoreAssembler};
use crate::backend::{
    BackendError, ChapSecret, DiscoveredTarget, EncryptionService, ExportTarget, ExportTargets,
    FileExclusions, Initiator, JobLabel, JobRunner, JobSpec, LoopDevice, LoopDevices, Passphrase,
    PartitionEntry, PartitionInspector, PartitionTable, RestoreLedger, StorageBackend, TargetName,
};
use crate::config::{Config, StorageConfig};
use crate::core::{Asset, AssetKey, CloneSpec, PeerAddress, Restore, RestoreKey, SnapshotEpoch};
use crate::mirror::{MirrorBackends, MirrorService};
use crate::paths::StateDir;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered record of collaborator calls, as `"<op> <subject>"` lines.
#[derive(Clone, Debug, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn record(&self, op: &str, subject: impl std::fmt::Display) {
        lock(&self.entries).push(format!("{op} {subject}"));
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// Operation names only, in call order.
    pub fn ops(&self) -> Vec<String> {
        lock(&self.entries)
            .iter()
            .map(|entry| entry.split(' ').next().unwrap_or_default().to_string())
            .collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.ops().iter().filter(|recorded| recorded.as_str() == op).count()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

/// Operation names that currently fail.
#[derive(Clone, Debug, Default)]
pub struct Faults {
    failing: Arc<Mutex<BTreeSet<String>>>,
}

impl Faults {
    pub fn fail(&self, op: &str) {
        lock(&self.failing).insert(op.to_string());
    }

    pub fn heal(&self, op: &str) {
        lock(&self.failing).remove(op);
    }

    fn check(&self, op: &str) -> Result<(), BackendError> {
        if lock(&self.failing).contains(op) {
            return Err(BackendError::CommandFailed {
                program: op.to_string(),
                code: Some(1),
                stderr: "injected failure".into(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
struct Shared {
    journal: Journal,
    faults: Faults,
}

impl Shared {
    /// Journal the call, then fail it if injected.
    fn call(&self, op: &str, subject: impl std::fmt::Display) -> Result<(), BackendError> {
        self.journal.record(op, subject);
        self.faults.check(op)
    }
}

pub struct FakeStorage {
    shared: Shared,
    config: StorageConfig,
    clones: Mutex<BTreeSet<String>>,
    snapshots: Mutex<BTreeMap<AssetKey, BTreeSet<SnapshotEpoch>>>,
}

impl FakeStorage {
    pub fn add_snapshot(&self, asset: &AssetKey, snapshot: SnapshotEpoch) {
        lock(&self.snapshots)
            .entry(asset.clone())
            .or_default()
            .insert(snapshot);
    }

    /// Make a clone exist without going through assembly.
    pub fn insert_clone(&self, spec: &CloneSpec) {
        lock(&self.clones).insert(spec.clone_name());
    }

    pub fn clones(&self) -> Vec<String> {
        lock(&self.clones).iter().cloned().collect()
    }
}

impl StorageBackend for FakeStorage {
    fn create_clone(&self, spec: &CloneSpec) -> Result<PathBuf, BackendError> {
        self.shared.call("storage.create_clone", spec)?;
        if !lock(&self.clones).insert(spec.clone_name()) {
            return Err(BackendError::AlreadyExists {
                what: "clone",
                name: spec.clone_name(),
            });
        }
        Ok(self.clone_mount_point(spec))
    }

    fn destroy_clone(&self, spec: &CloneSpec) -> Result<(), BackendError> {
        self.shared.call("storage.destroy_clone", spec)?;
        if !lock(&self.clones).remove(&spec.clone_name()) {
            return Err(BackendError::not_found("clone", spec.clone_name()));
        }
        Ok(())
    }

    fn clone_exists(&self, spec: &CloneSpec) -> Result<bool, BackendError> {
        Ok(lock(&self.clones).contains(&spec.clone_name()))
    }

    fn list_clones(&self) -> Result<Vec<String>, BackendError> {
        self.shared.call("storage.list_clones", "*")?;
        Ok(self.clones())
    }

    fn list_snapshots(&self, asset: &AssetKey) -> Result<BTreeSet<SnapshotEpoch>, BackendError> {
        self.shared.faults.check("storage.list_snapshots")?;
        Ok(lock(&self.snapshots)
            .get(asset)
            .cloned()
            .unwrap_or_default())
    }

    fn snapshot_dir(&self, asset: &AssetKey, snapshot: SnapshotEpoch) -> PathBuf {
        self.config
            .agents_mount_root
            .join(asset.as_str())
            .join(".zfs/snapshot")
            .join(snapshot.to_string())
    }

    fn clone_mount_point(&self, spec: &CloneSpec) -> PathBuf {
        spec.mount_point(&self.config.mount_root)
    }
}

#[derive(Debug)]
struct Attached {
    backing_file: PathBuf,
}

pub struct FakeLoops {
    shared: Shared,
    next: AtomicU64,
    attached: Mutex<BTreeMap<PathBuf, Attached>>,
    /// Partition count per image file name; one when unset.
    partitions: Mutex<BTreeMap<String, usize>>,
}

impl FakeLoops {
    pub fn set_partitions(&self, image_file_name: &str, count: usize) {
        lock(&self.partitions).insert(image_file_name.to_string(), count);
    }

    pub fn attached(&self) -> usize {
        lock(&self.attached).len()
    }
}

impl LoopDevices for FakeLoops {
    fn attach(&self, image: &Path) -> Result<LoopDevice, BackendError> {
        self.shared.call("loops.attach", image.display())?;
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let device = PathBuf::from(format!("/dev/loop{n}"));
        let count = image
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| lock(&self.partitions).get(name).copied())
            .unwrap_or(1);
        let partitions = (1..=count)
            .map(|p| PathBuf::from(format!("/dev/loop{n}p{p}")))
            .collect();
        lock(&self.attached).insert(
            device.clone(),
            Attached {
                backing_file: image.to_path_buf(),
            },
        );
        Ok(LoopDevice {
            device,
            backing_file: image.to_path_buf(),
            partitions,
        })
    }

    fn detach(&self, device: &Path) -> Result<(), BackendError> {
        self.shared.call("loops.detach", device.display())?;
        match lock(&self.attached).remove(device) {
            Some(_) => Ok(()),
            None => Err(BackendError::not_found("loop device", device.display().to_string())),
        }
    }

    fn detach_all_under(&self, dir: &Path) -> Result<usize, BackendError> {
        self.shared.call("loops.detach_all_under", dir.display())?;
        let mut attached = lock(&self.attached);
        let before = attached.len();
        attached.retain(|_, loop_dev| !loop_dev.backing_file.starts_with(dir));
        Ok(before - attached.len())
    }
}

pub struct FakeExports {
    shared: Shared,
    targets: Mutex<BTreeMap<TargetName, Vec<PathBuf>>>,
}

impl FakeExports {
    pub fn targets(&self) -> Vec<TargetName> {
        lock(&self.targets).keys().cloned().collect()
    }

    pub fn luns(&self, name: &TargetName) -> Option<Vec<PathBuf>> {
        lock(&self.targets).get(name).cloned()
    }
}

impl ExportTargets for FakeExports {
    fn create_target(
        &self,
        name: &TargetName,
        luns: &[PathBuf],
        _secret: &ChapSecret,
    ) -> Result<ExportTarget, BackendError> {
        self.shared.call("exports.create_target", name)?;
        let mut targets = lock(&self.targets);
        if targets.contains_key(name) {
            return Err(BackendError::AlreadyExists {
                what: "export target",
                name: name.to_string(),
            });
        }
        targets.insert(name.clone(), luns.to_vec());
        Ok(ExportTarget {
            name: name.clone(),
            luns: luns.to_vec(),
        })
    }

    fn delete_target(&self, name: &TargetName) -> Result<(), BackendError> {
        self.shared.call("exports.delete_target", name)?;
        match lock(&self.targets).remove(name) {
            Some(_) => Ok(()),
            None => Err(BackendError::not_found("export target", name.to_string())),
        }
    }

    fn target_exists(&self, name: &TargetName) -> Result<bool, BackendError> {
        Ok(lock(&self.targets).contains_key(name))
    }
}

#[derive(Default)]
struct Keys {
    encrypted: BTreeMap<AssetKey, String>,
    loaded: BTreeSet<AssetKey>,
    temporary: BTreeSet<AssetKey>,
}

pub struct FakeEncryption {
    shared: Shared,
    keys: Mutex<Keys>,
}

impl FakeEncryption {
    pub fn seal(&self, asset: &AssetKey, passphrase: &str) {
        let mut keys = lock(&self.keys);
        keys.encrypted.insert(asset.clone(), passphrase.to_string());
        keys.loaded.remove(asset);
    }

    pub fn grant_temporary_access(&self, asset: &AssetKey) {
        lock(&self.keys).temporary.insert(asset.clone());
    }

    pub fn is_loaded(&self, asset: &AssetKey) -> bool {
        lock(&self.keys).loaded.contains(asset)
    }
}

impl EncryptionService for FakeEncryption {
    fn is_encrypted(&self, asset: &AssetKey) -> Result<bool, BackendError> {
        Ok(lock(&self.keys).encrypted.contains_key(asset))
    }

    fn is_master_key_loaded(&self, asset: &AssetKey) -> Result<bool, BackendError> {
        Ok(lock(&self.keys).loaded.contains(asset))
    }

    fn has_temporary_access(&self, asset: &AssetKey) -> Result<bool, BackendError> {
        Ok(lock(&self.keys).temporary.contains(asset))
    }

    fn decrypt_master_key(
        &self,
        asset: &AssetKey,
        passphrase: &Passphrase,
    ) -> Result<(), BackendError> {
        self.shared.call("encryption.decrypt_master_key", asset)?;
        let mut keys = lock(&self.keys);
        if keys.encrypted.get(asset).map(String::as_str) != Some(passphrase.expose()) {
            return Err(BackendError::Refused {
                service: "encryption",
                reason: format!("wrong passphrase for {asset}"),
            });
        }
        keys.loaded.insert(asset.clone());
        Ok(())
    }
}

pub struct FakeExclusions {
    shared: Shared,
}

impl FileExclusions for FakeExclusions {
    fn apply(&self, asset: &Asset, _mount_point: &Path) -> Result<(), BackendError> {
        self.shared.call("exclusions.apply", &asset.key)
    }
}

pub struct MemoryLedger {
    shared: Shared,
    records: Mutex<BTreeMap<RestoreKey, Restore>>,
}

impl MemoryLedger {
    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RestoreLedger for MemoryLedger {
    fn find(&self, key: &RestoreKey) -> Result<Option<Restore>, BackendError> {
        Ok(lock(&self.records).get(key).cloned())
    }

    fn add(&self, restore: Restore) -> Result<(), BackendError> {
        let key = restore.key();
        self.shared.call("ledger.add", &key)?;
        let mut records = lock(&self.records);
        if records.contains_key(&key) {
            return Err(BackendError::AlreadyExists {
                what: "restore",
                name: key.to_string(),
            });
        }
        records.insert(key, restore);
        Ok(())
    }

    fn remove(&self, key: &RestoreKey) -> Result<bool, BackendError> {
        self.shared.call("ledger.remove", key)?;
        Ok(lock(&self.records).remove(key).is_some())
    }

    fn list(&self) -> Result<Vec<Restore>, BackendError> {
        Ok(lock(&self.records).values().cloned().collect())
    }
}

pub struct FakePartitions {
    shared: Shared,
    default: Mutex<PartitionTable>,
    tables: Mutex<BTreeMap<PathBuf, PartitionTable>>,
}

impl FakePartitions {
    /// Layout reported for images without an explicit table.
    pub fn set_default(&self, sector_size: u64, partitions: &[(u64, u64)]) {
        *lock(&self.default) = table(sector_size, partitions);
    }

    pub fn set_table(&self, image: impl Into<PathBuf>, sector_size: u64, partitions: &[(u64, u64)]) {
        lock(&self.tables).insert(image.into(), table(sector_size, partitions));
    }
}

fn table(sector_size: u64, partitions: &[(u64, u64)]) -> PartitionTable {
    PartitionTable {
        sector_size,
        partitions: partitions
            .iter()
            .map(|&(start_sector, sectors)| PartitionEntry {
                start_sector,
                sectors,
            })
            .collect(),
    }
}

impl PartitionInspector for FakePartitions {
    fn inspect(&self, image: &Path) -> Result<PartitionTable, BackendError> {
        self.shared.call("partitions.inspect", image.display())?;
        Ok(lock(&self.tables)
            .get(image)
            .cloned()
            .unwrap_or_else(|| lock(&self.default).clone()))
    }
}

#[derive(Default)]
struct Sessions {
    advertised: BTreeMap<PeerAddress, Vec<DiscoveredTarget>>,
    discovered: BTreeSet<PeerAddress>,
    logged_in: BTreeSet<(PeerAddress, String)>,
    devices: BTreeMap<String, Vec<PathBuf>>,
}

pub struct FakeInitiator {
    shared: Shared,
    sessions: Mutex<Sessions>,
}

impl FakeInitiator {
    pub fn advertise(&self, peer: &PeerAddress, target: &str) {
        lock(&self.sessions)
            .advertised
            .entry(peer.clone())
            .or_default()
            .push(DiscoveredTarget {
                portal: format!("{peer}:3260,1"),
                name: target.to_string(),
            });
    }

    /// Override the block devices a logged-in target exposes.
    pub fn set_devices(&self, target: &str, devices: Vec<PathBuf>) {
        lock(&self.sessions)
            .devices
            .insert(target.to_string(), devices);
    }

    pub fn is_logged_in(&self, peer: &PeerAddress, target: &str) -> bool {
        lock(&self.sessions)
            .logged_in
            .contains(&(peer.clone(), target.to_string()))
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).logged_in.len()
    }
}

impl Initiator for FakeInitiator {
    fn discover(&self, peer: &PeerAddress) -> Result<Vec<DiscoveredTarget>, BackendError> {
        self.shared.call("initiator.discover", peer)?;
        let mut sessions = lock(&self.sessions);
        sessions.discovered.insert(peer.clone());
        Ok(sessions.advertised.get(peer).cloned().unwrap_or_default())
    }

    fn login(&self, peer: &PeerAddress, target: &str) -> Result<(), BackendError> {
        self.shared.call("initiator.login", target)?;
        lock(&self.sessions)
            .logged_in
            .insert((peer.clone(), target.to_string()));
        Ok(())
    }

    fn logout(&self, peer: &PeerAddress, target: &str) -> Result<(), BackendError> {
        self.shared.call("initiator.logout", target)?;
        lock(&self.sessions)
            .logged_in
            .remove(&(peer.clone(), target.to_string()));
        Ok(())
    }

    fn logout_all(&self, peer: &PeerAddress) -> Result<(), BackendError> {
        self.shared.call("initiator.logout_all", peer)?;
        lock(&self.sessions)
            .logged_in
            .retain(|(logged_peer, _)| logged_peer != peer);
        Ok(())
    }

    fn purge_discovery(&self, peer: &PeerAddress) -> Result<(), BackendError> {
        self.shared.call("initiator.purge_discovery", peer)?;
        lock(&self.sessions).discovered.remove(peer);
        Ok(())
    }

    fn discovery_peers(&self) -> Result<Vec<PeerAddress>, BackendError> {
        self.shared.faults.check("initiator.discovery_peers")?;
        Ok(lock(&self.sessions).discovered.iter().cloned().collect())
    }

    fn block_devices(&self, peer: &PeerAddress, target: &str) -> Result<Vec<PathBuf>, BackendError> {
        self.shared.call("initiator.block_devices", target)?;
        let sessions = lock(&self.sessions);
        if !sessions
            .logged_in
            .contains(&(peer.clone(), target.to_string()))
        {
            return Ok(Vec::new());
        }
        Ok(sessions.devices.get(target).cloned().unwrap_or_else(|| {
            vec![PathBuf::from(format!(
                "/dev/disk/by-path/ip-{}-iscsi-{target}-lun-0",
                peer.file_component()
            ))]
        }))
    }
}

#[derive(Default)]
struct JobTable {
    launched: Vec<JobSpec>,
    running: BTreeSet<JobLabel>,
    started: BTreeSet<JobLabel>,
    stalled: bool,
}

/// Jobs never execute; they run until [`FakeJobs::finish`] is called.
pub struct FakeJobs {
    shared: Shared,
    table: Mutex<JobTable>,
}

impl FakeJobs {
    /// Launched jobs never report as started.
    pub fn stall(&self) {
        lock(&self.table).stalled = true;
    }

    pub fn finish(&self, label: &JobLabel) {
        lock(&self.table).running.remove(label);
    }

    /// Pretend a job launched elsewhere is running.
    pub fn mark_running(&self, label: &JobLabel) {
        let mut table = lock(&self.table);
        table.running.insert(label.clone());
        table.started.insert(label.clone());
    }

    pub fn launched(&self) -> Vec<JobSpec> {
        lock(&self.table).launched.clone()
    }
}

impl JobRunner for FakeJobs {
    fn launch(&self, job: &JobSpec) -> Result<(), BackendError> {
        self.shared.call("jobs.launch", &job.label)?;
        let mut table = lock(&self.table);
        if table.running.contains(&job.label) {
            return Err(BackendError::AlreadyExists {
                what: "job",
                name: job.label.to_string(),
            });
        }
        table.launched.push(job.clone());
        if !table.stalled {
            table.running.insert(job.label.clone());
            table.started.insert(job.label.clone());
        }
        Ok(())
    }

    fn is_running(&self, label: &JobLabel) -> Result<bool, BackendError> {
        self.shared.faults.check("jobs.is_running")?;
        Ok(lock(&self.table).running.contains(label))
    }

    fn has_started(&self, label: &JobLabel) -> Result<bool, BackendError> {
        Ok(lock(&self.table).started.contains(label))
    }

    fn running_labels(&self) -> Result<Vec<JobLabel>, BackendError> {
        Ok(lock(&self.table).running.iter().cloned().collect())
    }
}

/// Every fake wired to one journal and fault set, plus a scratch state dir.
pub struct Harness {
    pub journal: Journal,
    pub faults: Faults,
    pub config: Config,
    pub state_dir: StateDir,
    pub storage: Arc<FakeStorage>,
    pub loops: Arc<FakeLoops>,
    pub exports: Arc<FakeExports>,
    pub encryption: Arc<FakeEncryption>,
    pub exclusions: Arc<FakeExclusions>,
    pub ledger: Arc<MemoryLedger>,
    pub partitions: Arc<FakePartitions>,
    pub initiator: Arc<FakeInitiator>,
    pub jobs: Arc<FakeJobs>,
}

impl Harness {
    /// Mirror waits are shortened so failure paths stay fast.
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        let shared = Shared::default();
        let mut config = Config::default();
        config.mirror.settle_delay_ms = 0;
        config.mirror.start_poll_interval_ms = 1;
        config.mirror.start_poll_attempts = 3;
        Self {
            journal: shared.journal.clone(),
            faults: shared.faults.clone(),
            state_dir: StateDir::new(state_root),
            storage: Arc::new(FakeStorage {
                shared: shared.clone(),
                config: config.storage.clone(),
                clones: Mutex::default(),
                snapshots: Mutex::default(),
            }),
            loops: Arc::new(FakeLoops {
                shared: shared.clone(),
                next: AtomicU64::new(0),
                attached: Mutex::default(),
                partitions: Mutex::default(),
            }),
            exports: Arc::new(FakeExports {
                shared: shared.clone(),
                targets: Mutex::default(),
            }),
            encryption: Arc::new(FakeEncryption {
                shared: shared.clone(),
                keys: Mutex::default(),
            }),
            exclusions: Arc::new(FakeExclusions {
                shared: shared.clone(),
            }),
            ledger: Arc::new(MemoryLedger {
                shared: shared.clone(),
                records: Mutex::default(),
            }),
            partitions: Arc::new(FakePartitions {
                shared: shared.clone(),
                default: Mutex::new(table(512, &[(2048, 204_800)])),
                tables: Mutex::default(),
            }),
            initiator: Arc::new(FakeInitiator {
                shared: shared.clone(),
                sessions: Mutex::default(),
            }),
            jobs: Arc::new(FakeJobs {
                shared,
                table: Mutex::default(),
            }),
            config,
        }
    }

    pub fn assembly_backends(&self) -> AssemblyBackends {
        AssemblyBackends {
            storage: self.storage.clone(),
            loops: self.loops.clone(),
            exports: self.exports.clone(),
            encryption: self.encryption.clone(),
            exclusions: self.exclusions.clone(),
            ledger: self.ledger.clone(),
        }
    }

    pub fn mirror_backends(&self) -> MirrorBackends {
        MirrorBackends {
            initiator: self.initiator.clone(),
            storage: self.storage.clone(),
            partitions: self.partitions.clone(),
            jobs: self.jobs.clone(),
        }
    }

    pub fn assembler(&self) -> RestoreAssembler {
        RestoreAssembler::new(
            self.assembly_backends(),
            self.config.storage.clone(),
            self.config.export.clone(),
            self.state_dir.clone(),
        )
    }

    pub fn mirror_service(&self) -> MirrorService {
        self.mirror_service_with(self.mirror_backends())
    }

    /// Same configuration, different collaborators (e.g. a real job runner).
    pub fn mirror_service_with(&self, backends: MirrorBackends) -> MirrorService {
        MirrorService::new(
            backends,
            self.config.mirror.clone(),
            self.config.storage.clone(),
            self.state_dir.clone(),
        )
    }
}
