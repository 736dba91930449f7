//! End-to-end runs of the `testlauncher` binary against shell-script targets.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const CONFIG: &str = r#"
[platforms.linux-x64x11]
launcher = "local"
test_targets = ["base_unittests", "nplb"]

[[platforms.linux-x64x11.filters]]
target = "nplb"
test = "SbSocketTest.Broken"
"#;

const PASSING: &str = r#"#!/bin/sh
echo "[==========] 2 tests from 1 test suite ran. (3 ms total)"
echo "[  PASSED  ] 2 tests."
exit 0
"#;

const FAILING: &str = r#"#!/bin/sh
echo "[==========] 2 tests from 1 test suite ran. (3 ms total)"
echo "[  PASSED  ] 1 test."
echo "[  FAILED  ] 1 test, listed below:"
echo "[  FAILED  ] SbSocketTest.SunnyDay"
exit 1
"#;

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn workspace(nplb: &str) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("testlauncher.toml"), CONFIG).unwrap();
    let out = dir.path().join("out");
    std::fs::create_dir(&out).unwrap();
    write_script(&out, "base_unittests", PASSING);
    write_script(&out, "nplb", nplb);
    dir
}

fn testlauncher(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("testlauncher").unwrap();
    cmd.current_dir(dir.path())
        .args(["-p", "linux-x64x11", "-c", "devel", "-o", "out"]);
    cmd
}

#[test]
fn test_all_targets_pass() {
    let dir = workspace(PASSING);

    testlauncher(&dir)
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Starting nplb ARGS:--gtest_filter=-SbSocketTest.Broken",
        ))
        .stdout(predicate::str::contains("base_unittests: SUCCEEDED"))
        .stdout(predicate::str::contains("nplb: SUCCEEDED"))
        .stdout(predicate::str::contains("TOTAL TESTS RUN: 4"));
}

#[test]
fn test_failed_case_fails_run() {
    let dir = workspace(FAILING);

    testlauncher(&dir)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("nplb: FAILED"))
        .stdout(predicate::str::contains("FAILED TESTS:\n    SbSocketTest.SunnyDay"))
        .stdout(predicate::str::contains("FAILED TARGETS: nplb"));
}

#[test]
fn test_single_target_exit_code() {
    let dir = workspace("#!/bin/sh\necho partial output\nexit 7\n");

    testlauncher(&dir)
        .args(["-t", "nplb"])
        .assert()
        .code(7)
        .stdout(predicate::str::contains("partial output"))
        .stdout(predicate::str::contains("nplb: FAILED (CRASHED)"))
        .stdout(predicate::str::contains("base_unittests").not());
}

#[test]
fn test_dry_run_executes_nothing() {
    let dir = workspace("#!/bin/sh\ntouch ran\nexit 1\n");

    testlauncher(&dir)
        .arg("-n")
        .assert()
        .success()
        .stdout(predicate::str::contains("--gtest_list_tests"));
    assert!(!dir.path().join("out/ran").exists());
}

#[test]
fn test_junit_report() {
    let dir = workspace(FAILING);

    testlauncher(&dir)
        .args(["--junit", "reports/junit.xml"])
        .assert()
        .code(1);

    let xml = std::fs::read_to_string(dir.path().join("reports/junit.xml")).unwrap();
    assert!(xml.contains(r#"<testsuite name="nplb""#));
    assert!(xml.contains(r#"<testcase classname="nplb.SbSocketTest" name="SunnyDay">"#));
}

#[test]
fn test_log_level_from_environment() {
    let dir = workspace(PASSING);

    testlauncher(&dir)
        .env_remove("RUST_LOG")
        .assert()
        .success()
        .stderr(predicate::str::contains("Creating local launcher").not());

    testlauncher(&dir)
        .env("RUST_LOG", "debug")
        .assert()
        .success()
        .stderr(predicate::str::contains("Creating local launcher for nplb"));

    testlauncher(&dir)
        .env_remove("RUST_LOG")
        .arg("-v")
        .assert()
        .success()
        .stderr(predicate::str::contains("Creating local launcher for nplb"));
}

#[test]
fn test_unknown_platform() {
    let dir = workspace(PASSING);

    Command::cargo_bin("testlauncher")
        .unwrap()
        .current_dir(dir.path())
        .args(["-p", "ps5"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unknown platform: ps5"));
}

#[test]
fn test_missing_platform_is_misuse() {
    Command::cargo_bin("testlauncher")
        .unwrap()
        .assert()
        .code(2);
}

#[test]
fn test_coverage_report_requires_dir() {
    let dir = workspace(PASSING);

    testlauncher(&dir).arg("--coverage_report").assert().code(2);
}
