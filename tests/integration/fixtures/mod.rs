#![allow(dead_code)]

pub mod tools;

use bmr_rs::assembly::{AssembledRestore, AssemblyError};
use bmr_rs::backend::Passphrase;
use bmr_rs::core::{Asset, AssetKey, CloneSpec, CloneSuffix, PeerAddress, SnapshotEpoch, VolumeGuid};
use bmr_rs::mirror::MirrorRequest;
use bmr_rs::test_harness::Harness;
use tempfile::TempDir;

pub const VOLUME: &str = "3f2a9c1e-0b7d";
pub const PEER: &str = "10.20.0.7";

/// One protected asset with a single volume, wired to in-memory collaborators.
pub struct Scenario {
    pub dir: TempDir,
    pub harness: Harness,
    pub asset: Asset,
    pub peer: PeerAddress,
}

impl Scenario {
    pub fn new() -> Self {
        Self::for_asset("A1")
    }

    pub fn for_asset(key: &str) -> Self {
        let dir = TempDir::new().expect("create scenario dir");
        let harness = Harness::new(dir.path().join("state"));
        let asset = Asset::new(
            AssetKey::new(key).expect("asset key"),
            vec![VolumeGuid::new(VOLUME).expect("volume guid")],
        );
        Self {
            dir,
            harness,
            asset,
            peer: PeerAddress::new(PEER).expect("peer"),
        }
    }

    pub fn volume(&self) -> VolumeGuid {
        self.asset.volumes[0].clone()
    }

    pub fn spec(&self, epoch: u64, suffix: CloneSuffix) -> CloneSpec {
        CloneSpec::new(self.asset.key.clone(), SnapshotEpoch(epoch), suffix)
    }

    pub fn assemble(&self, spec: &CloneSpec) -> Result<AssembledRestore, AssemblyError> {
        self.harness
            .assembler()
            .assemble(self.asset.clone(), spec.clone(), None)
    }

    pub fn assemble_with(
        &self,
        spec: &CloneSpec,
        passphrase: &str,
    ) -> Result<AssembledRestore, AssemblyError> {
        self.harness.assembler().assemble(
            self.asset.clone(),
            spec.clone(),
            Some(Passphrase::new(passphrase)),
        )
    }

    pub fn add_snapshots(&self, epochs: &[u64]) {
        for &epoch in epochs {
            self.harness
                .storage
                .add_snapshot(&self.asset.key, SnapshotEpoch(epoch));
        }
    }

    /// The peer advertises one target carrying our volume guid.
    pub fn advertise_volume(&self) -> String {
        let target = format!("iqn.2007-01.net.peer:restore-{VOLUME}");
        self.harness.initiator.advertise(&self.peer, &target);
        target
    }

    pub fn request(&self, last_mirrored: u64, target: Option<u64>) -> MirrorRequest {
        MirrorRequest {
            peer: self.peer.clone(),
            asset: self.asset.key.clone(),
            volume: self.volume(),
            last_mirrored: SnapshotEpoch(last_mirrored),
            target: target.map(SnapshotEpoch),
        }
    }
}
