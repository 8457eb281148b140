//! CLI integration tests for the concern-sync binary
//!
//! These tests run the compiled binary and check its stdout and exit codes.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

/// Get a Command instance for the concern-sync binary
#[allow(deprecated)]
fn concern_sync_cmd() -> Command {
    let mut cmd = Command::cargo_bin("concern-sync").expect("Failed to find concern-sync binary");
    cmd.env_remove("RUST_LOG");
    cmd
}

fn settings_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write settings");
    file
}

// ============================================================================
// --help and --version
// ============================================================================

#[test]
fn test_help_lists_commands() {
    concern_sync_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("classify"))
        .stdout(predicate::str::contains("simulate"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version_flag() {
    concern_sync_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_missing_command_fails() {
    concern_sync_cmd().assert().failure();
}

#[test]
fn test_verbose_conflicts_with_quiet() {
    concern_sync_cmd()
        .args(["-v", "-q", "config"])
        .assert()
        .failure();
}

// ============================================================================
// classify command
// ============================================================================

#[test]
fn test_classify_network_error() {
    concern_sync_cmd()
        .args(["classify", "TypeError: Failed to fetch"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"kind\": \"network\""))
        .stdout(predicate::str::contains("\"retryable\": true"));
}

#[test]
fn test_classify_with_status_code() {
    let output = concern_sync_cmd()
        .args(["classify", "request rejected", "--status-code", "401"])
        .output()
        .expect("Failed to run classify");
    assert!(output.status.success());

    let json: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("classify should print JSON");
    assert_eq!(json["kind"], "authentication");
    assert_eq!(json["severity"], "critical");
    assert_eq!(json["retryable"], false);
    assert_eq!(json["message"], "request rejected");
    assert_eq!(json["context"]["status_code"], "401");
}

#[test]
fn test_classify_unrecognized_message() {
    concern_sync_cmd()
        .args(["classify", "something odd happened"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"kind\": \"unknown\""));
}

// ============================================================================
// config command
// ============================================================================

#[test]
fn test_config_prints_defaults() {
    concern_sync_cmd()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("delay_ms = 500"))
        .stdout(predicate::str::contains("max_wait_ms = 2000"))
        .stdout(predicate::str::contains("[requeue]"));
}

#[test]
fn test_config_reads_file() {
    let file = settings_file("delay_ms = 250\nbatch_size = 2\n");
    concern_sync_cmd()
        .arg("config")
        .arg("--config")
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("delay_ms = 250"))
        .stdout(predicate::str::contains("batch_size = 2"));
}

#[test]
fn test_config_environment_override() {
    concern_sync_cmd()
        .arg("config")
        .env("CONCERN_SYNC__BATCH_SIZE", "7")
        .assert()
        .success()
        .stdout(predicate::str::contains("batch_size = 7"));
}

#[test]
fn test_config_missing_file_fails() {
    concern_sync_cmd()
        .args(["config", "--config", "does/not/exist.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("settings file not found"));
}

#[test]
fn test_config_invalid_values_fail() {
    let file = settings_file("delay_ms = 3000\nmax_wait_ms = 1000\n");
    concern_sync_cmd()
        .arg("config")
        .arg("--config")
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid settings"));
}

// ============================================================================
// simulate command
// ============================================================================

#[test]
fn test_simulate_coalesces_flips() {
    let output = concern_sync_cmd()
        .args([
            "-q",
            "simulate",
            "--concerns",
            "2",
            "--flips",
            "3",
            "--interval-ms",
            "0",
        ])
        .output()
        .expect("Failed to run simulate");
    assert!(output.status.success());

    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("simulate should print JSON");
    assert_eq!(report["requests"], 6);
    assert_eq!(report["remote_calls"], 2);
    assert_eq!(report["rollbacks"], 0);
    assert_eq!(report["converged"], true);
    assert_eq!(report["remote"]["c1"], "addressed");
}

#[test]
fn test_simulate_permanent_failure_rolls_back() {
    let output = concern_sync_cmd()
        .args([
            "-q",
            "simulate",
            "--concerns",
            "1",
            "--flips",
            "1",
            "--fail-first",
            "1",
            "--failure",
            "permission denied",
        ])
        .output()
        .expect("Failed to run simulate");
    assert!(output.status.success());

    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("simulate should print JSON");
    assert_eq!(report["remote_calls"], 1);
    assert_eq!(report["rollbacks"], 1);
    assert_eq!(report["errors"][0]["kind"], "authentication");
    assert_eq!(report["displayed"]["c1"], "to_review");
}
