//! Command line behaviour of the timewarp binary

use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_cli_help() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("timewarp");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"))
        .stdout(predicate::str::contains("--idleness"))
        .stdout(predicate::str::contains("--signal"));
}

#[test]
fn test_cli_version() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("timewarp");
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_cli_requires_command() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("timewarp");
    cmd.assert().code(1).stderr(predicate::str::contains("COMMAND"));
}

#[test]
fn test_cli_rejects_unknown_signal() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("timewarp");
    cmd.args(["--signal=SIGBOGUS", "--", "true"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unrecognised signal"));
}

#[test]
fn test_cli_rejects_bad_idleness() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("timewarp");
    cmd.args(["--idleness=10parsecs", "--", "true"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("wrong TIMEOUT"));
}

#[test]
fn test_cli_rejects_empty_command_group() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("timewarp");
    cmd.args(["--no-preload", "--", "true", "--"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("empty command"));
}

#[test]
fn test_cli_libpath_without_library() {
    let dir = TempDir::new().unwrap();
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("timewarp");
    cmd.arg(format!("--libpath={}", dir.path().display()))
        .args(["--", "true"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("libtimewarp_preload.so"));
}
