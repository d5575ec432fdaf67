#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const CONFIG: &str = r#"
nodes:
  - { name: batch1, hostname: localhost }
node_pools:
  - { name: batch, nodes: [batch1] }
jobs:
  - name: nightly
    node: batch
    schedule: { type: daily, time: "04:00:00" }
    actions:
      - { name: extract, command: "extract --date {shortdate-1}" }
      - { name: load, command: "load", requires: [extract] }
    cleanup_action: { command: "rm -rf /tmp/{run_id}" }
services:
  - name: web
    node: batch
    count: 2
    command: "start-web --pid {pid_file}"
    pid_file: "/tmp/{name}-{instance_number}.pid"
"#;

fn trond() -> Command {
    let mut cmd = Command::cargo_bin("trond").unwrap();
    cmd.env_remove("TRON_CONFIG");
    cmd
}

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("tron.yaml");
    std::fs::write(&path, body).unwrap();
    path
}

// ---------------------------------------------------------------------------
// trond check
// ---------------------------------------------------------------------------

#[test]
fn check_summarises_valid_config() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);
    trond()
        .args(["check", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("nightly"))
        .stdout(predicate::str::contains("daily 04:00:00"))
        .stdout(predicate::str::contains("web"));
}

#[test]
fn check_json_output() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);
    let output = trond()
        .args(["check", "--json", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["jobs"][0]["name"], "nightly");
    assert_eq!(report["jobs"][0]["schedule"], "daily 04:00:00");
    assert_eq!(report["services"][0]["count"], 2);
    assert_eq!(report["services"][0]["monitor_interval"], 20);
    assert!(report["warnings"].as_array().unwrap().is_empty());
}

#[test]
fn check_reports_unknown_dependency() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
nodes:
  - { name: batch1, hostname: localhost }
jobs:
  - name: broken
    node: batch1
    schedule: { type: interval, seconds: 60 }
    actions:
      - { name: load, command: "load", requires: [extract] }
"#,
    );
    trond()
        .args(["check", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown action 'extract'"))
        .stderr(predicate::str::contains("config has 1 error(s)"));
}

#[test]
fn check_reports_unknown_node() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
services:
  - name: web
    node: nowhere
    count: 1
    command: "serve"
    pid_file: "/tmp/web.pid"
"#,
    );
    trond()
        .args(["check", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown node 'nowhere'"));
}

#[test]
fn check_warns_but_passes_on_zero_count() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
nodes:
  - { name: batch1, hostname: localhost }
services:
  - name: idle
    node: batch1
    count: 0
    command: "serve"
    pid_file: "/tmp/idle.pid"
"#,
    );
    trond()
        .args(["check", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stderr(predicate::str::contains("warning: service 'idle' has count 0"));
}

#[test]
fn check_missing_config_fails() {
    let dir = TempDir::new().unwrap();
    trond()
        .args(["check", "--config"])
        .arg(dir.path().join("absent.yaml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("error: failed to load config"));
}

// ---------------------------------------------------------------------------
// trond run
// ---------------------------------------------------------------------------

#[test]
fn run_missing_config_fails() {
    let dir = TempDir::new().unwrap();
    trond()
        .args(["run", "--config"])
        .arg(dir.path().join("absent.yaml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn run_refuses_legacy_state_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);
    std::fs::write(dir.path().join("tron_state.yaml"), "jobs: {}\n").unwrap();
    trond()
        .args(["run", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to restore state"))
        .stderr(predicate::str::contains("no version marker"));
}
