use bmr_rs::assembly::AssemblyError;
use bmr_rs::backend::{BackendError, ExportTargets, RestoreLedger};
use bmr_rs::core::{AssetKey, CloneSpec, CloneSuffix, RestoreKey, RestoreType, SnapshotEpoch};

use crate::fixtures::{Scenario, VOLUME};

const COMMITS: [&str; 5] = [
    "storage.create_clone",
    "loops.attach",
    "exports.create_target",
    "exclusions.apply",
    "ledger.add",
];

/// Operations journaled after the first call to `op`.
fn after(scenario: &Scenario, op: &str) -> Vec<String> {
    let ops = scenario.harness.journal.ops();
    let at = ops
        .iter()
        .position(|recorded| recorded == op)
        .unwrap_or_else(|| panic!("{op} was never called: {ops:?}"));
    ops[at + 1..].to_vec()
}

fn assert_nothing_left(scenario: &Scenario) {
    let harness = &scenario.harness;
    assert!(harness.storage.clones().is_empty(), "clone left behind");
    assert!(harness.exports.targets().is_empty(), "export target left behind");
    assert!(harness.ledger.is_empty(), "restore record left behind");
    assert_eq!(harness.loops.attached(), 0, "loop device left behind");
}

#[test]
fn successful_assembly_leaves_one_of_each_artifact() {
    let scenario = Scenario::new();
    let spec = scenario.spec(1000, CloneSuffix::bmr());

    let assembled = scenario.assemble(&spec).unwrap();

    let harness = &scenario.harness;
    assert_eq!(harness.journal.ops(), COMMITS);
    assert_eq!(harness.storage.clones(), vec!["A1-1000-bmr".to_string()]);
    assert_eq!(harness.exports.targets(), vec![assembled.target.clone()]);
    assert_eq!(harness.ledger.len(), 1);
    assert_eq!(assembled.restore.restore_type, RestoreType::Bmr);
    assert_eq!(assembled.restore.options.export_target, assembled.target.to_string());
    assert_eq!(assembled.restore.options.clone_suffix, CloneSuffix::bmr());
    assert_eq!(
        harness.exports.luns(&assembled.target).unwrap(),
        assembled.luns
    );
    assert!(harness.state_dir.clone_timestamp_path(&spec).exists());
}

#[test]
fn differential_rollback_suffix_selects_its_restore_type() {
    let scenario = Scenario::new();
    let spec = scenario.spec(1000, CloneSuffix::differential_rollback());
    let assembled = scenario.assemble(&spec).unwrap();
    assert_eq!(assembled.restore.restore_type, RestoreType::DifferentialRollback);

    let other = scenario.spec(1000, CloneSuffix::new("bmr-legacy").unwrap());
    let assembled = scenario.assemble(&other).unwrap();
    assert_eq!(assembled.restore.restore_type, RestoreType::Bmr);
}

#[test]
fn export_failure_unwinds_loops_then_clone() {
    let scenario = Scenario::new();
    scenario.harness.faults.fail("exports.create_target");
    let spec = scenario.spec(1000, CloneSuffix::bmr());

    let err = scenario.assemble(&spec).unwrap_err();

    assert!(matches!(
        err,
        AssemblyError::Backend {
            stage: "create-mercury-target",
            source: BackendError::CommandFailed { .. },
        }
    ));
    assert_eq!(
        after(&scenario, "exports.create_target"),
        ["loops.detach_all_under", "storage.destroy_clone"]
    );
    assert_nothing_left(&scenario);
    assert!(!scenario.harness.state_dir.clone_timestamp_path(&spec).exists());
}

#[test]
fn save_failure_unwinds_every_prior_stage_in_reverse() {
    let scenario = Scenario::new();
    scenario.harness.faults.fail("ledger.add");
    let spec = scenario.spec(1000, CloneSuffix::bmr());

    scenario.assemble(&spec).unwrap_err();

    // The failing stage itself is never rolled back, so no ledger.remove.
    assert_eq!(
        after(&scenario, "ledger.add"),
        [
            "exports.delete_target",
            "loops.detach_all_under",
            "storage.destroy_clone"
        ]
    );
    assert_nothing_left(&scenario);
}

#[test]
fn clone_failure_has_nothing_to_unwind() {
    let scenario = Scenario::new();
    scenario.harness.faults.fail("storage.create_clone");
    scenario
        .assemble(&scenario.spec(1000, CloneSuffix::bmr()))
        .unwrap_err();
    assert!(after(&scenario, "storage.create_clone").is_empty());
    assert_nothing_left(&scenario);
}

#[test]
fn exclusion_failures_do_not_fail_the_restore() {
    let scenario = Scenario::new();
    scenario.harness.faults.fail("exclusions.apply");
    scenario
        .assemble(&scenario.spec(1000, CloneSuffix::bmr()))
        .unwrap();
    assert_eq!(scenario.harness.ledger.len(), 1);
    assert_eq!(scenario.harness.exports.targets().len(), 1);
}

#[test]
fn two_partitions_are_rejected_before_any_export() {
    let scenario = Scenario::new();
    scenario
        .harness
        .loops
        .set_partitions(&format!("{VOLUME}.datto"), 2);

    let err = scenario
        .assemble(&scenario.spec(1000, CloneSuffix::bmr()))
        .unwrap_err();

    assert!(matches!(
        err,
        AssemblyError::UnexpectedPartitionCount { found: 2, .. }
    ));
    assert_eq!(scenario.harness.journal.count("exports.create_target"), 0);
    assert_nothing_left(&scenario);
}

#[test]
fn sealed_asset_requires_the_right_passphrase() {
    let scenario = Scenario::new();
    let key = scenario.asset.key.clone();
    scenario.harness.encryption.seal(&key, "hunter2");
    let spec = scenario.spec(1000, CloneSuffix::bmr());

    let err = scenario.assemble(&spec).unwrap_err();
    assert!(matches!(err, AssemblyError::PassphraseRequired { .. }));
    let err = scenario.assemble_with(&spec, "wrong").unwrap_err();
    assert!(matches!(
        err,
        AssemblyError::Backend {
            source: BackendError::Refused { .. },
            ..
        }
    ));
    assert_nothing_left(&scenario);

    scenario.assemble_with(&spec, "hunter2").unwrap();
    assert!(scenario.harness.encryption.is_loaded(&key));
}

#[test]
fn temporary_access_skips_unsealing() {
    let scenario = Scenario::new();
    let key = scenario.asset.key.clone();
    scenario.harness.encryption.seal(&key, "hunter2");
    scenario.harness.encryption.grant_temporary_access(&key);

    scenario
        .assemble(&scenario.spec(1000, CloneSuffix::bmr()))
        .unwrap();
    assert_eq!(
        scenario.harness.journal.count("encryption.decrypt_master_key"),
        0
    );
}

#[test]
fn second_assembly_of_the_same_restore_is_refused() {
    let scenario = Scenario::new();
    let spec = scenario.spec(1000, CloneSuffix::bmr());
    scenario.assemble(&spec).unwrap();
    scenario.harness.journal.clear();

    let err = scenario.assemble(&spec).unwrap_err();
    assert!(matches!(err, AssemblyError::AlreadyAssembled(_)));
    assert!(scenario.harness.journal.ops().is_empty());
    assert_eq!(scenario.harness.storage.clones().len(), 1);
}

#[test]
fn teardown_is_idempotent() {
    let scenario = Scenario::new();
    let spec = scenario.spec(1000, CloneSuffix::bmr());
    scenario.assemble(&spec).unwrap();
    let assembler = scenario.harness.assembler();

    assembler.teardown(&spec).unwrap();
    assert_nothing_left(&scenario);
    assert!(
        scenario
            .harness
            .ledger
            .find(&RestoreKey::for_clone(&spec))
            .unwrap()
            .is_none()
    );
    assert!(!scenario.harness.state_dir.clone_timestamp_path(&spec).exists());

    assembler.teardown(&spec).unwrap();
    assembler
        .teardown(&scenario.spec(2000, CloneSuffix::bmr()))
        .unwrap();
}

#[test]
fn orphan_teardown_spares_a_case_twin_export() {
    let scenario = Scenario::new();
    let spec = scenario.spec(1000, CloneSuffix::bmr());
    let assembled = scenario.assemble(&spec).unwrap();
    let twin = CloneSpec::new(
        AssetKey::new("a1").unwrap(),
        SnapshotEpoch(1000),
        CloneSuffix::bmr(),
    );
    scenario.harness.storage.insert_clone(&twin);

    scenario.harness.assembler().teardown(&twin).unwrap();

    assert!(scenario.harness.exports.target_exists(&assembled.target).unwrap());
    assert_eq!(scenario.harness.storage.clones(), vec![spec.clone_name()]);
}
