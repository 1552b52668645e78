//! Integration tests for the strand binary: config layering, search over an
//! index file, and the function listing.

use std::process::Command;

/// Run strand in a subprocess with the given args and env. Returns (success, stdout, stderr).
fn run_strand(args: &[&str], env_extra: &[(&str, &str)]) -> (bool, String, String) {
    let exe = env!("CARGO_BIN_EXE_strand");
    let mut cmd = Command::new(exe);
    cmd.args(args);
    cmd.env_remove("STRAND_CONFIG");
    for (k, v) in env_extra {
        cmd.env(k, v);
    }
    let out = cmd.output().expect("run strand");
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    (out.status.success(), stdout, stderr)
}

#[test]
fn validate_config_no_config_prints_defaults() {
    let (ok, stdout, stderr) = run_strand(&["--validate-config", "--no-config"], &[]);
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("max_grid_step=86400"), "stdout: {}", stdout);
    assert!(stdout.contains("fallback_step=60"), "stdout: {}", stdout);
    assert!(stdout.contains("fetch_timeout_ms=none"), "stdout: {}", stdout);
    assert!(stdout.contains("worker_threads=auto"), "stdout: {}", stdout);
    assert!(stdout.contains("log_events=false"), "stdout: {}", stdout);
}

#[test]
fn validate_config_reads_file_and_env_overrides_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("strand.toml");
    std::fs::write(
        &path,
        "max_grid_step = 3600\nfetch_timeout_ms = 1500\n\n[[consolidation]]\npattern = \"*.count\"\nfunc = \"sum\"\n",
    )
    .expect("write config");
    let path = path.to_str().expect("utf-8 path");

    let (ok, stdout, stderr) = run_strand(&["--validate-config", "--config", path], &[]);
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("max_grid_step=3600"), "stdout: {}", stdout);
    assert!(stdout.contains("fetch_timeout_ms=1500"), "stdout: {}", stdout);
    assert!(stdout.contains("consolidation.*.count=sum"), "stdout: {}", stdout);

    let (ok, stdout, _) = run_strand(
        &["--validate-config", "--config", path],
        &[("STRAND_MAX_GRID_STEP", "7200")],
    );
    assert!(ok);
    assert!(stdout.contains("max_grid_step=7200"), "env should win: {}", stdout);
}

#[test]
fn log_events_flag_is_applied() {
    let (ok, stdout, _) = run_strand(&["--validate-config", "--no-config", "--log-events"], &[]);
    assert!(ok);
    assert!(stdout.contains("log_events=true"), "stdout: {}", stdout);
}

#[test]
fn missing_config_file_fails() {
    let (ok, _, stderr) = run_strand(&["--validate-config", "--config", "/nonexistent/strand.toml"], &[]);
    assert!(!ok);
    assert!(stderr.contains("config file not found"), "stderr: {}", stderr);
}

#[test]
fn invalid_value_in_config_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("strand.toml");
    std::fs::write(&path, "fallback_step = 0\n").expect("write config");

    let (ok, _, stderr) = run_strand(&["--validate-config", "--config", path.to_str().unwrap()], &[]);
    assert!(!ok);
    assert!(stderr.contains("fallback_step"), "stderr: {}", stderr);
}

#[test]
fn search_lists_matching_index_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let index = dir.path().join("metrics.idx");
    std::fs::write(&index, "servers.web1.cpu\nservers.web2.cpu\nservers.db1.mem\n").expect("write index");

    let (ok, stdout, stderr) = run_strand(
        &["--no-config", "search", "servers.web*", "--index", index.to_str().unwrap()],
        &[],
    );
    assert!(ok, "stderr: {}", stderr);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        vec!["servers.", "servers.web1.", "servers.web1.cpu", "servers.web2.", "servers.web2.cpu"]
    );
}

#[test]
fn search_index_can_come_from_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let index = dir.path().join("metrics.idx");
    std::fs::write(&index, "a.b\na.c\n").expect("write index");
    let config = dir.path().join("strand.toml");
    std::fs::write(&config, format!("index_file = {:?}\n", index.to_str().unwrap())).expect("write config");

    let (ok, stdout, stderr) = run_strand(
        &["--config", config.to_str().unwrap(), "search", "a.*", "--max-results", "1"],
        &[],
    );
    assert!(ok, "stderr: {}", stderr);
    assert_eq!(stdout.lines().count(), 1, "stdout: {}", stdout);
}

#[test]
fn search_without_index_fails() {
    let (ok, _, stderr) = run_strand(&["--no-config", "search", "a.*"], &[]);
    assert!(!ok);
    assert!(stderr.contains("--index"), "stderr: {}", stderr);
}

#[test]
fn functions_lists_the_registry() {
    let (ok, stdout, stderr) = run_strand(&["--no-config", "functions"], &[]);
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.lines().any(|l| l == "sumSeries\tCombine"), "stdout: {}", stdout);
    assert!(stdout.lines().any(|l| l == "timeShift\tContextual"), "stdout: {}", stdout);
}
