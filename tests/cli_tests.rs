//! Integration tests for the method-tracer binary
#![allow(deprecated)] // suppress assert_cmd::Command::cargo_bin deprecation in tests

mod utils;

use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use utils::*;

fn json_summary(output: &std::process::Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout).unwrap()
}

fn classes(workspace: &Path) -> std::path::PathBuf {
    let input = workspace.join("classes");
    write_file(&input, "app/MainActivity.class", &simple_class("app/MainActivity"));
    write_file(&input, "app/BuildConfig.class", &simple_class("app/BuildConfig"));
    input
}

#[test]
fn test_help_describes_tool() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("method-tracer");
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("timing probes"))
        .stdout(predicate::str::contains("--incremental"));
}

#[test]
fn test_requires_input() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("method-tracer");
    cmd.assert().failure();
}

#[test]
fn test_json_summary_on_stdout() {
    let dir = TempDir::new().unwrap();
    let input = classes(dir.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("method-tracer");
    cmd.arg("--output-dir")
        .arg(dir.path().join("out"))
        .arg("--format")
        .arg("json")
        .arg(&input);
    let output = cmd.output().unwrap();
    assert!(output.status.success());

    let summary = json_summary(&output);
    assert_eq!(summary["enabled"], true);
    assert_eq!(summary["entries_seen"], 2);
    assert_eq!(summary["entries_rewritten"], 2);
    assert_eq!(summary["methods_instrumented"], 4);
    assert!(summary["failures"].as_array().unwrap().is_empty());
}

#[test]
fn test_text_summary_on_stderr() {
    let dir = TempDir::new().unwrap();
    let input = classes(dir.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("method-tracer");
    cmd.arg("-o").arg(dir.path().join("out")).arg(&input);
    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Methods instrumented: 4"))
        .stderr(predicate::str::contains("total"));
}

#[test]
fn test_whitelist_flag_keeps_units_verbatim() {
    let dir = TempDir::new().unwrap();
    let input = classes(dir.path());
    let whitelist = dir.path().join("whitelist.json");
    fs::write(&whitelist, r#"["BuildConfig", "R.class"]"#).unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("method-tracer");
    cmd.arg("-o")
        .arg(dir.path().join("out"))
        .arg("--whitelist")
        .arg(&whitelist)
        .arg("--format")
        .arg("json")
        .arg(&input);
    let output = cmd.output().unwrap();
    assert!(output.status.success());
    assert_eq!(json_summary(&output)["entries_rewritten"], 1);
}

#[test]
fn test_missing_whitelist_fails() {
    let dir = TempDir::new().unwrap();
    let input = classes(dir.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("method-tracer");
    cmd.arg("-o")
        .arg(dir.path().join("out"))
        .arg("--whitelist")
        .arg(dir.path().join("nope.json"))
        .arg(&input);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Whitelist file not found"));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn test_output_inside_input_fails() {
    let dir = TempDir::new().unwrap();
    let input = classes(dir.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("method-tracer");
    cmd.arg("-o").arg(input.join("traced")).arg(&input);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("overlaps input"));
}

#[test]
fn test_missing_input_fails() {
    let dir = TempDir::new().unwrap();
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("method-tracer");
    cmd.arg("-o")
        .arg(dir.path().join("out"))
        .arg(dir.path().join("does-not-exist"));
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Input not found"));
}

#[test]
fn test_corrupted_unit_does_not_fail_run() {
    let dir = TempDir::new().unwrap();
    let input = classes(dir.path());
    write_file(&input, "app/Broken.class", b"\xCA\xFE\xBA\xBE");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("method-tracer");
    cmd.arg("-o")
        .arg(dir.path().join("out"))
        .arg("--format")
        .arg("json")
        .arg(&input);
    let output = cmd.output().unwrap();
    assert!(output.status.success());

    let summary = json_summary(&output);
    let failures = summary["failures"].as_array().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["path"], "app/Broken.class");
    assert_eq!(failures[0]["kind"], "unit");
}

#[test]
fn test_disable_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let input = classes(dir.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("method-tracer");
    cmd.arg("-o")
        .arg(dir.path().join("out"))
        .arg("--disable")
        .arg(&input);
    cmd.assert()
        .success()
        .stderr(predicate::str::contains("disabled"));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn test_incremental_second_run_is_unchanged() {
    let dir = TempDir::new().unwrap();
    let input = classes(dir.path());
    let run = || {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("method-tracer");
        cmd.arg("-o")
            .arg(dir.path().join("out"))
            .arg("--incremental")
            .arg("--format")
            .arg("json")
            .arg(&input);
        cmd.output().unwrap()
    };

    let first = run();
    assert!(first.status.success());
    assert_eq!(json_summary(&first)["entries_rewritten"], 2);
    assert!(dir.path().join("out/.trace-state.json").is_file());

    let second = run();
    assert!(second.status.success());
    let summary = json_summary(&second);
    assert_eq!(summary["entries_rewritten"], 0);
    assert_eq!(summary["entries_unchanged"], 2);
    assert_eq!(summary["trees"][0]["mode"], "incremental");
}

#[test]
fn test_config_file_with_flag_override() {
    let dir = TempDir::new().unwrap();
    let input = classes(dir.path());
    let config = dir.path().join("method-tracer.toml");
    fs::write(
        &config,
        format!(
            "output_dir = {:?}\npackageList = [\"org.nothing\"]\n",
            dir.path().join("from-config").to_string_lossy()
        ),
    )
    .unwrap();

    // package_list from the file excludes everything
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("method-tracer");
    cmd.arg("--config")
        .arg(&config)
        .arg("--format")
        .arg("json")
        .arg(&input);
    let output = cmd.output().unwrap();
    assert!(output.status.success());
    assert_eq!(json_summary(&output)["entries_rewritten"], 0);
    assert!(dir.path().join("from-config").is_dir());

    // -p replaces the configured package list
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("method-tracer");
    cmd.arg("--config")
        .arg(&config)
        .arg("-p")
        .arg("app")
        .arg("--format")
        .arg("json")
        .arg(&input);
    let output = cmd.output().unwrap();
    assert_eq!(json_summary(&output)["entries_rewritten"], 2);
}

#[test]
fn test_invalid_config_file_fails() {
    let dir = TempDir::new().unwrap();
    let input = classes(dir.path());
    let config = dir.path().join("bad.toml");
    fs::write(&config, "enabled = [").unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("method-tracer");
    cmd.arg("--config").arg(&config).arg(&input);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Invalid config file"));
}
