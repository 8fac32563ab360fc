use std::fs;
use std::sync::Arc;
use std::time::Duration;

use bmr_rs::backend::{ExportTargets, JobState, ProcessJobRunner, RestoreLedger};
use bmr_rs::core::{CloneSuffix, RestoreKey, RestoreType, SnapshotEpoch};
use bmr_rs::mirror::{MirrorBackends, MirrorOutcome, MirrorService};

use crate::fixtures::Scenario;
use crate::fixtures::tools::Tools;

const JOB_TIMEOUT: Duration = Duration::from_secs(20);

fn mirror_with_processes(scenario: &Scenario) -> (Arc<ProcessJobRunner>, MirrorService) {
    let jobs = Arc::new(ProcessJobRunner::new(scenario.harness.state_dir.clone()));
    let backends = MirrorBackends {
        jobs: jobs.clone(),
        ..scenario.harness.mirror_backends()
    };
    (jobs, scenario.harness.mirror_service_with(backends))
}

fn exit_files(scenario: &Scenario) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(scenario.harness.state_dir.mirror_dir())
        .unwrap()
        .filter_map(|entry| entry.unwrap().file_name().into_string().ok())
        .filter(|name| name.ends_with(".exit"))
        .collect();
    names.sort();
    names
}

#[test]
fn assemble_then_mirror_to_a_newer_snapshot() {
    let mut scenario = Scenario::new();
    let tools = Tools::install(&scenario.dir.path().join("tools"));
    tools.configure(&mut scenario.harness.config.mirror);

    let spec = scenario.spec(1000, CloneSuffix::bmr());
    let assembled = scenario.assemble(&spec).unwrap();
    let key = RestoreKey::for_clone(&spec);
    let restore = scenario.harness.ledger.find(&key).unwrap().unwrap();
    assert_eq!(restore.asset.as_str(), "A1");
    assert_eq!(restore.snapshot, SnapshotEpoch(1000));
    assert_eq!(restore.restore_type, RestoreType::Bmr);
    assert!(scenario.harness.exports.target_exists(&assembled.target).unwrap());

    scenario.add_snapshots(&[1000, 1100]);
    scenario.advertise_volume();
    let (jobs, service) = mirror_with_processes(&scenario);

    let started = service
        .start(&scenario.request(1000, Some(1100)))
        .unwrap();
    assert_eq!(
        jobs.wait_for_exit(&started.label, JOB_TIMEOUT),
        Some(JobState::Exited(Some(0)))
    );

    let status = service
        .status(
            &scenario.peer,
            &scenario.asset.key,
            &scenario.volume(),
            SnapshotEpoch(1100),
        )
        .unwrap();
    assert!(!status.running);
    assert!(status.succeeded());
    assert_eq!(fs::read_to_string(&started.exit_file).unwrap().trim(), "0");
    assert_eq!(exit_files(&scenario).len(), 1);

    let written = tools.written().unwrap();
    let mut lines = written.lines();
    assert_eq!(
        lines.next().unwrap(),
        format!("{} -1048576", started.device.display())
    );
    let delta = lines.next().unwrap();
    assert!(delta.starts_with("delta /home/agents/A1/.zfs/snapshot/1000 /home/agents/A1/.zfs/snapshot/1100"));
    assert!(delta.ends_with("1048576 104857600"));
}

#[test]
fn failed_stream_is_reported_without_touching_the_restore() {
    let mut scenario = Scenario::new();
    let tools = Tools::install_with_diff_status(&scenario.dir.path().join("tools"), 3);
    tools.configure(&mut scenario.harness.config.mirror);

    let spec = scenario.spec(1000, CloneSuffix::bmr());
    scenario.assemble(&spec).unwrap();
    scenario.add_snapshots(&[1000, 1100]);
    scenario.advertise_volume();
    let (jobs, service) = mirror_with_processes(&scenario);

    let started = service
        .start(&scenario.request(1000, None))
        .unwrap();
    assert_eq!(
        jobs.wait_for_exit(&started.label, JOB_TIMEOUT),
        Some(JobState::Exited(Some(3)))
    );

    let status = service
        .status(
            &scenario.peer,
            &scenario.asset.key,
            &scenario.volume(),
            started.target_snapshot,
        )
        .unwrap();
    assert_eq!(status.outcome, Some(MirrorOutcome::Failed(Some(3))));
    assert!(
        scenario
            .harness
            .ledger
            .find(&RestoreKey::for_clone(&spec))
            .unwrap()
            .is_some()
    );

    // The pair is free again once the job has exited.
    assert!(!service.running(&scenario.peer, &scenario.asset.key).unwrap());
    let report = service.cleanup(&scenario.peer).unwrap();
    assert_eq!(report.exit_files_removed, 1);
    assert!(exit_files(&scenario).is_empty());
}
