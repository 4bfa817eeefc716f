use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;
use tempfile::TempDir;

fn cmd(dir: &TempDir) -> Command {
    let mut c = Command::new(assert_cmd::cargo::cargo_bin!("capibara"));
    c.args([
        "--no-sandbox",
        "--cache-dir",
    ])
    .arg(dir.path().join("cache"))
    .arg("--audit-dir")
    .arg(dir.path().join("audit"))
    .arg("--policies-dir")
    .arg(dir.path().join("policies"));
    c
}

#[test]
fn health_reports_no_sandbox_and_no_providers() {
    let dir = TempDir::new().unwrap();
    cmd(&dir)
        .arg("health")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"sandbox\":false"));
}

#[test]
fn stats_on_empty_cache_reports_zero_entries() {
    let dir = TempDir::new().unwrap();
    cmd(&dir)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"cache\""));
}

#[test]
fn list_scripts_on_empty_cache_returns_empty_array() {
    let dir = TempDir::new().unwrap();
    cmd(&dir)
        .args(["list-scripts"])
        .assert()
        .success()
        .stdout("[]\n");
}

#[test]
fn clear_all_on_empty_cache_reports_zero_cleared() {
    let dir = TempDir::new().unwrap();
    cmd(&dir)
        .args(["clear", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"cleared_count\":0"));
}

#[test]
fn run_without_any_configured_provider_exits_with_internal_error_code() {
    let dir = TempDir::new().unwrap();
    cmd(&dir)
        .args(["run", "print hello", "--language", "python"])
        .assert()
        .failure()
        .code(3);
}

#[test]
fn show_of_unknown_script_id_exits_with_user_error_code() {
    let dir = TempDir::new().unwrap();
    cmd(&dir)
        .args(["show", "script_does_not_exist"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn doctor_reports_cache_writable() {
    let dir = TempDir::new().unwrap();
    cmd(&dir)
        .arg("doctor")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"cache_writable\":true"));
}
