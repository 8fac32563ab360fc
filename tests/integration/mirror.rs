use std::fs;
use std::path::PathBuf;
use std::thread;

use bmr_rs::backend::StorageBackend;
use bmr_rs::core::{AssetKey, PeerAddress, SnapshotEpoch};
use bmr_rs::mirror::{
    LeasePhase, MirrorError, MirrorOutcome, MirrorRequest, MirrorStatus, lease,
    mirror_job_label,
};

use crate::fixtures::{Scenario, VOLUME};

fn ready() -> Scenario {
    let scenario = Scenario::new();
    scenario.add_snapshots(&[900, 1000, 1100]);
    scenario.advertise_volume();
    scenario
}

#[test]
fn start_streams_latest_snapshot_onto_the_logged_in_device() {
    let scenario = ready();
    let service = scenario.harness.mirror_service();

    let started = service.start(&scenario.request(1000, None)).unwrap();

    assert_eq!(started.target_snapshot, SnapshotEpoch(1100));
    assert_eq!(started.geometry.offset, 2048 * 512);
    assert_eq!(started.geometry.length, 204_800 * 512);
    assert_eq!(
        started.label,
        mirror_job_label(&scenario.peer, &scenario.asset.key).unwrap()
    );
    assert!(
        scenario
            .harness
            .initiator
            .is_logged_in(&scenario.peer, &started.target_name)
    );

    let launched = scenario.harness.jobs.launched();
    assert_eq!(launched.len(), 1);
    let script = &launched[0].args[1];
    assert!(script.contains("'/home/agents/A1/.zfs/snapshot/1000'"));
    assert!(script.contains("'/home/agents/A1/.zfs/snapshot/1100'"));
    assert!(script.contains(&format!("'{VOLUME}' 1048576 104857600")));
    assert!(script.contains(&format!("'{}' -1048576", started.device.display())));
    assert!(script.contains(&started.exit_file.display().to_string()));

    let leases = lease::read_leases(&scenario.harness.state_dir).unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].1.phase, LeasePhase::Streaming);
    assert_eq!(leases[0].1.target_snapshot, Some(SnapshotEpoch(1100)));
}

#[test]
fn checks_run_before_the_peer_is_contacted() {
    let scenario = ready();
    let service = scenario.harness.mirror_service();
    let start = |last, target| service.start(&scenario.request(last, target));

    assert!(matches!(
        start(1100, None).unwrap_err(),
        MirrorError::AlreadyUpToDate { .. }
    ));
    assert!(matches!(
        start(1100, Some(1000)).unwrap_err(),
        MirrorError::AlreadyUpToDate { .. }
    ));
    assert!(matches!(
        start(1000, Some(1200)).unwrap_err(),
        MirrorError::SnapshotMissing { snapshot: SnapshotEpoch(1200), .. }
    ));
    assert!(matches!(
        start(950, Some(1100)).unwrap_err(),
        MirrorError::SnapshotMissing { snapshot: SnapshotEpoch(950), .. }
    ));

    let image = scenario
        .harness
        .storage
        .snapshot_dir(&scenario.asset.key, SnapshotEpoch(1100))
        .join(format!("{VOLUME}.datto"));
    scenario
        .harness
        .partitions
        .set_table(image, 512, &[(2048, 100), (4096, 100)]);
    assert!(matches!(
        start(1000, Some(1100)).unwrap_err(),
        MirrorError::PartitionCount { found: 2, .. }
    ));

    let journal = &scenario.harness.journal;
    assert_eq!(journal.count("initiator.discover"), 0);
    assert_eq!(journal.count("jobs.launch"), 0);
    assert!(lease::read_leases(&scenario.harness.state_dir).unwrap().is_empty());
}

#[test]
fn second_start_for_the_same_pair_fails_fast() {
    let scenario = ready();
    let service = scenario.harness.mirror_service();
    service.start(&scenario.request(1000, Some(1100))).unwrap();
    scenario.harness.journal.clear();

    let err = service.start(&scenario.request(1000, Some(1100))).unwrap_err();

    assert!(matches!(err, MirrorError::AlreadyRunning { .. }));
    assert!(scenario.harness.journal.ops().is_empty());
    assert_eq!(scenario.harness.jobs.launched().len(), 1);
}

#[test]
fn concurrent_starts_launch_exactly_one_job() {
    let scenario = ready();
    let service = scenario.harness.mirror_service();
    let request = scenario.request(1000, Some(1100));

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| service.start(&request)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    for result in &results {
        if let Err(err) = result {
            assert!(matches!(err, MirrorError::AlreadyRunning { .. }), "{err}");
        }
    }
    assert_eq!(scenario.harness.jobs.launched().len(), 1);
}

#[test]
fn finished_job_frees_the_pair() {
    let scenario = ready();
    let service = scenario.harness.mirror_service();
    let started = service.start(&scenario.request(900, Some(1000))).unwrap();
    assert!(service.running(&scenario.peer, &scenario.asset.key).unwrap());

    scenario.harness.jobs.finish(&started.label);
    assert!(!service.running(&scenario.peer, &scenario.asset.key).unwrap());
    assert!(!service.running_for_asset(&scenario.asset.key).unwrap());

    service.start(&scenario.request(1000, Some(1100))).unwrap();
    assert_eq!(scenario.harness.jobs.launched().len(), 2);
}

#[test]
fn target_discovery_requires_exactly_one_match() {
    let scenario = Scenario::new();
    scenario.add_snapshots(&[1000, 1100]);
    let service = scenario.harness.mirror_service();
    scenario
        .harness
        .initiator
        .advertise(&scenario.peer, "iqn.2007-01.net.peer:unrelated");

    let err = service.start(&scenario.request(1000, None)).unwrap_err();
    assert!(matches!(err, MirrorError::TargetCount { found: 0, .. }));

    scenario.advertise_volume();
    scenario.advertise_volume();
    let err = service.start(&scenario.request(1000, None)).unwrap_err();
    assert!(matches!(err, MirrorError::TargetCount { found: 2, .. }));
    assert_eq!(scenario.harness.journal.count("initiator.login"), 0);
}

#[test]
fn rejected_start_keeps_the_previous_outcome() {
    let scenario = Scenario::new();
    scenario.add_snapshots(&[1000, 1100]);
    let state = &scenario.harness.state_dir;
    let exit_file = state.mirror_exit_path(
        &scenario.peer,
        &scenario.asset.key,
        &scenario.volume(),
        SnapshotEpoch(1100),
    );
    fs::create_dir_all(state.mirror_dir()).unwrap();
    fs::write(&exit_file, "1\n").unwrap();
    let service = scenario.harness.mirror_service();

    let err = service.start(&scenario.request(1000, None)).unwrap_err();

    assert!(matches!(err, MirrorError::TargetCount { found: 0, .. }));
    let status = service
        .status(
            &scenario.peer,
            &scenario.asset.key,
            &scenario.volume(),
            SnapshotEpoch(1100),
        )
        .unwrap();
    assert_eq!(status.outcome, Some(MirrorOutcome::Failed(Some(1))));
    assert_eq!(fs::read_to_string(&exit_file).unwrap(), "1\n");
}

#[test]
fn pairs_differing_only_in_dash_placement_run_side_by_side() {
    let scenario = ready();
    let service = scenario.harness.mirror_service();
    let dashed = AssetKey::new("east-A1").unwrap();
    let backup = PeerAddress::new("backup").unwrap();
    let backup_east = PeerAddress::new("backup-east").unwrap();
    for asset in [&dashed, &scenario.asset.key] {
        for snapshot in [1000, 1100] {
            scenario.harness.storage.add_snapshot(asset, SnapshotEpoch(snapshot));
        }
    }
    let target = format!("iqn.2007-01.net.peer:restore-{VOLUME}");
    scenario.harness.initiator.advertise(&backup, &target);
    scenario.harness.initiator.advertise(&backup_east, &target);
    let request = |peer: &PeerAddress, asset: &AssetKey| MirrorRequest {
        peer: peer.clone(),
        asset: asset.clone(),
        volume: scenario.volume(),
        last_mirrored: SnapshotEpoch(1000),
        target: Some(SnapshotEpoch(1100)),
    };

    let first = service.start(&request(&backup, &dashed)).unwrap();
    assert!(!service.running(&backup_east, &scenario.asset.key).unwrap());
    let second = service.start(&request(&backup_east, &scenario.asset.key)).unwrap();

    assert_ne!(first.label, second.label);
    assert_ne!(first.exit_file, second.exit_file);
    assert!(service.running(&backup, &dashed).unwrap());
    assert!(service.running(&backup_east, &scenario.asset.key).unwrap());
    assert_eq!(scenario.harness.jobs.launched().len(), 2);
}

#[test]
fn job_that_never_starts_undoes_the_login() {
    let scenario = ready();
    scenario.harness.jobs.stall();
    let service = scenario.harness.mirror_service();

    let err = service.start(&scenario.request(1000, None)).unwrap_err();

    assert!(matches!(err, MirrorError::JobNotStarted { attempts: 3, .. }));
    assert_eq!(scenario.harness.journal.count("initiator.logout"), 1);
    assert_eq!(scenario.harness.initiator.session_count(), 0);
    assert!(lease::read_leases(&scenario.harness.state_dir).unwrap().is_empty());
}

#[test]
fn missing_block_device_undoes_the_login() {
    let scenario = ready();
    let target = format!("iqn.2007-01.net.peer:restore-{VOLUME}");
    scenario.harness.initiator.set_devices(&target, Vec::new());
    let service = scenario.harness.mirror_service();

    let err = service.start(&scenario.request(1000, None)).unwrap_err();

    assert!(matches!(err, MirrorError::BlockDeviceCount { found: 0, .. }));
    assert_eq!(scenario.harness.initiator.session_count(), 0);
    assert_eq!(scenario.harness.journal.count("jobs.launch"), 0);
}

#[test]
fn status_reads_the_exit_file() {
    let scenario = ready();
    let service = scenario.harness.mirror_service();
    let started = service.start(&scenario.request(1000, Some(1100))).unwrap();
    let status = || {
        service
            .status(
                &scenario.peer,
                &scenario.asset.key,
                &scenario.volume(),
                SnapshotEpoch(1100),
            )
            .unwrap()
    };

    assert_eq!(
        status(),
        MirrorStatus {
            running: true,
            outcome: None
        }
    );

    scenario.harness.jobs.finish(&started.label);
    fs::write(&started.exit_file, "0\n").unwrap();
    assert!(status().succeeded());

    fs::write(&started.exit_file, "2\n").unwrap();
    assert_eq!(status().outcome, Some(MirrorOutcome::Failed(Some(2))));
}

#[test]
fn cleanup_only_touches_the_given_peer() {
    let scenario = ready();
    let service = scenario.harness.mirror_service();
    let started = service.start(&scenario.request(1000, Some(1100))).unwrap();
    scenario.harness.jobs.finish(&started.label);

    let state = &scenario.harness.state_dir;
    let other = PeerAddress::new("10.20.0.77").unwrap();
    let keep: PathBuf =
        state.mirror_exit_path(&other, &scenario.asset.key, &scenario.volume(), SnapshotEpoch(1100));
    fs::write(&started.exit_file, "0\n").unwrap();
    fs::write(
        state.mirror_exit_path(
            &scenario.peer,
            &scenario.asset.key,
            &scenario.volume(),
            SnapshotEpoch(1000),
        ),
        "0\n",
    )
    .unwrap();
    fs::write(&keep, "0\n").unwrap();

    let report = service.cleanup(&scenario.peer).unwrap();

    assert_eq!(report.exit_files_removed, 2);
    assert_eq!(report.leases_removed, 1);
    assert!(keep.exists());
    assert!(!started.exit_file.exists());
    assert_eq!(scenario.harness.initiator.session_count(), 0);
    assert_eq!(scenario.harness.journal.count("initiator.purge_discovery"), 1);
}
