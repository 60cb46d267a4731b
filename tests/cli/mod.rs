use assert_cmd::Command;
use predicates::prelude::*;
use sandbroker::policy::PolicyConfig;
use sandbroker::types::ContainerLevel;
use serial_test::serial;

#[test]
fn help_lists_the_subcommands() {
    Command::cargo_bin("sandbroker")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run").and(predicate::str::contains("info")));
}

#[test]
fn info_reports_container_support() {
    Command::cargo_bin("sandbroker")
        .unwrap()
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("cgroups available"));
}

#[test]
#[serial]
fn run_executes_a_confined_target() {
    Command::cargo_bin("sandbroker")
        .unwrap()
        .args(["run", "/bin/true"])
        .assert()
        .success();
}

#[test]
#[serial]
fn run_loads_a_policy_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.json");
    let mut config = PolicyConfig::default();
    config.level = ContainerLevel::Unprotected;
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    Command::cargo_bin("sandbroker")
        .unwrap()
        .arg("run")
        .arg("--policy")
        .arg(&path)
        .arg("/bin/true")
        .assert()
        .success();
}

#[test]
fn run_rejects_an_unknown_level() {
    Command::cargo_bin("sandbroker")
        .unwrap()
        .args(["run", "--level", "mystery", "/bin/true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown confinement level"));
}

#[test]
fn run_propagates_the_target_exit_code() {
    Command::cargo_bin("sandbroker")
        .unwrap()
        .args(["run", "/bin/false"])
        .assert()
        .code(1);
}
