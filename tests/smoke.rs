//! Smoke tests -- verify the binary runs and key subcommands load.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("testflight")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "Parallel test-run scheduling and process supervision",
        ));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("testflight")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("testflight"));
}

#[test]
fn test_run_subcommand_exists() {
    Command::cargo_bin("testflight")
        .unwrap()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--jobs"));
}

#[test]
fn test_status_on_fresh_db_reports_no_runs() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("testflight.db");
    Command::cargo_bin("testflight")
        .unwrap()
        .args(["status", "--db", db.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicates::str::contains("No recorded runs."));
}

#[test]
fn test_run_executes_explicit_units_and_reports_summary() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("testflight.db");
    Command::cargo_bin("testflight")
        .unwrap()
        .args([
            "run",
            "--db",
            db.to_str().unwrap(),
            "--runner",
            "sh",
            "--runner-arg",
            "-c",
            "--runner-arg",
            "exit 0",
            "--refresh",
            "0.1",
            "test_alpha",
            "test_beta",
        ])
        .assert()
        .success()
        .stdout(predicates::str::contains("2 passed, 0 failed"));
}

#[test]
fn test_run_with_failing_unit_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("testflight.db");
    Command::cargo_bin("testflight")
        .unwrap()
        .args([
            "run",
            "--db",
            db.to_str().unwrap(),
            "--runner",
            "sh",
            "--runner-arg",
            "-c",
            "--runner-arg",
            "exit 1",
            "--refresh",
            "0.1",
            "test_alpha",
        ])
        .assert()
        .failure()
        .stdout(predicates::str::contains("1 failed"));
}
