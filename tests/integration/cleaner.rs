use std::fs;
use std::sync::Arc;

use bmr_rs::backend::Initiator;
use bmr_rs::cleaner::{Activity, BmrCleaner};
use bmr_rs::core::{CloneSpec, CloneSuffix, PeerAddress, WallClock};

use crate::fixtures::Scenario;

const HOUR_MS: u64 = 60 * 60 * 1000;

fn cleaner(scenario: &Scenario) -> BmrCleaner {
    let harness = &scenario.harness;
    BmrCleaner::new(
        Arc::new(harness.assembler()),
        Arc::new(harness.mirror_service()),
        harness.config.cleaner.clone(),
        harness.state_dir.clone(),
    )
}

fn created(cleaner: &BmrCleaner, spec: &CloneSpec) -> WallClock {
    match cleaner.activity(spec).unwrap() {
        Activity::Pull { created } => created,
        other => panic!("expected pull-style activity, got {other:?}"),
    }
}

#[test]
fn pull_style_restore_is_destroyed_only_after_the_grace_period() {
    let scenario = Scenario::new();
    let spec = scenario.spec(1000, CloneSuffix::bmr());
    scenario.assemble(&spec).unwrap();
    let cleaner = cleaner(&scenario);
    let created = created(&cleaner, &spec);

    let report = cleaner
        .clean_stale_bmrs_at(false, WallClock(created.0 + 23 * HOUR_MS))
        .unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.skipped_fresh, 1);
    assert_eq!(scenario.harness.storage.clones().len(), 1);

    let report = cleaner
        .clean_stale_bmrs_at(false, WallClock(created.0 + 24 * HOUR_MS))
        .unwrap();
    assert_eq!(report.destroyed, 0, "exactly 24h is not yet stale");

    let report = cleaner
        .clean_stale_bmrs_at(false, WallClock(created.0 + 25 * HOUR_MS))
        .unwrap();
    assert_eq!(report.destroyed, 1);
    assert!(scenario.harness.storage.clones().is_empty());
    assert!(scenario.harness.exports.targets().is_empty());
    assert!(scenario.harness.ledger.is_empty());
    assert_eq!(scenario.harness.loops.attached(), 0);
}

#[test]
fn immediate_sweep_ignores_age() {
    let scenario = Scenario::new();
    let bmr = scenario.spec(1000, CloneSuffix::bmr());
    let rollback = scenario.spec(1100, CloneSuffix::differential_rollback());
    scenario.assemble(&bmr).unwrap();
    scenario.assemble(&rollback).unwrap();

    let report = cleaner(&scenario).clean_stale_bmrs(true).unwrap();

    assert_eq!(report.examined, 2);
    assert_eq!(report.destroyed, 2);
    assert!(scenario.harness.storage.clones().is_empty());
}

#[test]
fn push_style_restore_is_never_destroyed() {
    let scenario = Scenario::new();
    let spec = scenario.spec(1000, CloneSuffix::bmr());
    scenario.assemble(&spec).unwrap();
    let progress = scenario.harness.state_dir.progress_dir(&spec);
    fs::create_dir_all(&progress).unwrap();
    fs::write(progress.join("3f2a9c1e-0b7d.log"), "12%\n").unwrap();

    let report = cleaner(&scenario).clean_stale_bmrs(true).unwrap();

    assert_eq!(report.skipped_push, 1);
    assert_eq!(scenario.harness.storage.clones().len(), 1);
}

#[test]
fn running_mirror_blocks_destruction() {
    let scenario = Scenario::new();
    let spec = scenario.spec(1000, CloneSuffix::bmr());
    scenario.assemble(&spec).unwrap();
    scenario.add_snapshots(&[1000, 1100]);
    scenario.advertise_volume();
    let started = scenario
        .harness
        .mirror_service()
        .start(&scenario.request(1000, Some(1100)))
        .unwrap();
    let cleaner = cleaner(&scenario);

    let report = cleaner.clean_stale_bmrs(true).unwrap();
    assert_eq!(report.skipped_running, 1);
    assert_eq!(scenario.harness.storage.clones().len(), 1);

    scenario.harness.jobs.finish(&started.label);
    let report = cleaner.clean_stale_bmrs(true).unwrap();
    assert_eq!(report.destroyed, 1);
}

#[test]
fn discovery_db_keeps_peers_with_running_mirrors() {
    let scenario = Scenario::new();
    scenario.add_snapshots(&[1000, 1100]);
    scenario.advertise_volume();
    scenario
        .harness
        .mirror_service()
        .start(&scenario.request(1000, None))
        .unwrap();
    let idle = PeerAddress::new("10.20.0.8").unwrap();
    scenario.harness.initiator.discover(&idle).unwrap();

    let report = cleaner(&scenario).clean_discovery_db().unwrap();

    assert_eq!(report.purged, 1);
    assert_eq!(report.skipped_running, 1);
    assert_eq!(
        scenario.harness.initiator.discovery_peers().unwrap(),
        vec![scenario.peer.clone()]
    );
    assert_eq!(scenario.harness.initiator.session_count(), 1);
}
