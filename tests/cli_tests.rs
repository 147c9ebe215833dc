//! Integration tests for the hilvan binary
#![allow(deprecated)] // suppress assert_cmd::Command::cargo_bin deprecation in tests

use predicates::prelude::*;
use tempfile::TempDir;

fn hilvan() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("hilvan");
    // Keep the tests independent of the caller's environment
    for var in [
        "HILVAN_DISABLED",
        "HILVAN_OVERHEAD_PERCENT",
        "HILVAN_THROTTLE",
        "HILVAN_TRACK_ALL_WORKERS",
        "HILVAN_CAPTURE_ERRORS",
        "HILVAN_ERROR_TRACE_DEPTH",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_simulate_text_report() {
    hilvan()
        .args(["simulate", "--load", "0.8"])
        .assert()
        .success()
        .stdout(predicate::str::contains("measured:     5000"))
        .stdout(predicate::str::contains("skipped:      0"))
        .stdout(predicate::str::contains("(target 1%)"));
}

#[test]
fn test_simulate_json_report_throttles() {
    let output = hilvan()
        .args(["simulate", "--load", "2", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(report["skipped"].as_u64().unwrap() > 0);
    assert_eq!(
        report["measured"].as_u64().unwrap() + report["skipped"].as_u64().unwrap(),
        5000
    );
}

#[test]
fn test_simulate_no_throttle() {
    hilvan()
        .args(["simulate", "--load", "10", "--no-throttle", "--precision-ns", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("skipped:      0"));
}

#[test]
fn test_simulate_rejects_invalid_load() {
    hilvan()
        .args(["simulate", "--load", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("measured load must be in (0, 100]"));
}

#[test]
fn test_simulate_vanishing_load() {
    hilvan()
        .args(["simulate", "--load", "1e-300", "--repeats", "10"])
        .assert()
        .success()
        .stdout(predicate::str::contains("measured:     10"));
}

#[test]
fn test_demo_prints_async_boundary() {
    hilvan()
        .args(["demo", "--hops", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--- async boundary ---"))
        .stdout(predicate::str::contains("schedule_hop"));
}

#[test]
fn test_demo_rejects_zero_hops() {
    hilvan()
        .args(["demo", "--hops", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--hops"));
}

#[test]
fn test_demo_json_rows() {
    let output = hilvan().args(["demo", "--format", "json"]).output().unwrap();
    assert!(output.status.success());

    let table: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rows = table["rows"].as_array().unwrap();
    assert!(!rows.is_empty());
    // Boundaries are null rows
    assert!(rows.iter().any(serde_json::Value::is_null));
}

#[test]
fn test_demo_wire_file_decodes() {
    let dir = TempDir::new().unwrap();
    let trace = dir.path().join("trace.bin");

    hilvan()
        .args(["demo", "--hops", "3", "--output"])
        .arg(&trace)
        .assert()
        .success();
    assert!(trace.exists());

    hilvan()
        .arg("decode")
        .arg(&trace)
        .assert()
        .success()
        .stdout(predicate::str::contains("--- async boundary ---"));
}

#[test]
fn test_decode_rejects_garbage() {
    let dir = TempDir::new().unwrap();
    let garbage = dir.path().join("garbage.bin");
    std::fs::write(&garbage, [0x07, 0x01, 0x02]).unwrap();

    hilvan()
        .arg("decode")
        .arg(&garbage)
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not a valid trace"));
}

#[test]
fn test_decode_missing_file() {
    hilvan()
        .args(["decode", "/nonexistent/trace.bin"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read"));
}

#[test]
fn test_config_defaults() {
    let output = hilvan().arg("config").output().unwrap();
    assert!(output.status.success());

    let config: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(config["overhead_percent"], 1.0);
    assert_eq!(config["enabled"], true);
    assert_eq!(config["flatten_depth"], 100);
}

#[test]
fn test_config_reads_environment() {
    hilvan()
        .arg("config")
        .env("HILVAN_OVERHEAD_PERCENT", "2.5")
        .env("HILVAN_THROTTLE", "yes")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"overhead_percent\": 2.5"))
        .stdout(predicate::str::contains("\"throttle_when_overhead\": true"));
}

#[test]
fn test_config_rejects_invalid_environment() {
    hilvan()
        .arg("config")
        .env("HILVAN_OVERHEAD_PERCENT", "lots")
        .assert()
        .failure()
        .stderr(predicate::str::contains("HILVAN_OVERHEAD_PERCENT"));
}

#[test]
fn test_debug_flag_logs_to_stderr() {
    hilvan()
        .args(["--debug", "demo", "--hops", "1"])
        .assert()
        .success()
        .stderr(predicate::str::contains("demo finished"));
}
