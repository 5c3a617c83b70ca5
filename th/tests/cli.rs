//! CLI tests for the `th` binary

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

/// A scratch environment with its own config, store, and log directory
struct Env {
    dir: TempDir,
    config: PathBuf,
}

impl Env {
    fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = dir.path().join("taskhistory.yml");
        let store = dir.path().join("store").join("task_history.json");
        fs::write(
            &config,
            format!("store:\n  path: {}\nwait:\n  timeout-secs: 1\n", store.display()),
        )
        .expect("Failed to write config");
        Self { dir, config }
    }

    fn store_path(&self) -> PathBuf {
        self.dir.path().join("store").join("task_history.json")
    }

    fn th(&self) -> Command {
        let mut cmd = Command::cargo_bin("th").expect("th binary should build");
        cmd.current_dir(self.dir.path())
            .env("XDG_DATA_HOME", self.dir.path().join("data"))
            .env("NO_COLOR", "1")
            .arg("--config")
            .arg(&self.config);
        cmd
    }

    fn create_json(&self) -> Value {
        let output = self
            .th()
            .args(["create", "--message", "Starting video processing", "--format", "json"])
            .output()
            .expect("Failed to run th");
        assert!(output.status.success());
        serde_json::from_slice(&output.stdout).expect("create should print JSON")
    }
}

fn read_document(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn test_create_prints_id() {
    let env = Env::new();
    env.th()
        .arg("create")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created task:"));

    let doc = read_document(&env.store_path());
    assert_eq!(doc.as_object().unwrap().len(), 1);
}

#[test]
fn test_create_json_then_get() {
    let env = Env::new();
    let created = env.create_json();
    assert_eq!(created["status"], "processing");
    let id = created["id"].as_str().unwrap();

    env.th()
        .args(["get", id])
        .assert()
        .success()
        .stdout(predicate::str::contains("processing"))
        .stdout(predicate::str::contains("Starting video processing"));
}

#[test]
fn test_update_to_completed_and_wait_returns() {
    let env = Env::new();
    let created = env.create_json();
    let id = created["id"].as_str().unwrap();

    env.th()
        .args(["update", id, "completed", "--extra", "output_path=/out/x.mp4"])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"));

    let output = env
        .th()
        .args(["wait", id, "--timeout", "5", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let record: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(record["status"], "completed");
    assert_eq!(record["output_path"], "/out/x.mp4");
    assert!(record["completed_at"].is_string());
}

#[test]
fn test_wait_on_processing_task_times_out() {
    let env = Env::new();
    let created = env.create_json();
    let id = created["id"].as_str().unwrap();

    env.th()
        .args(["wait", id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("timeout after"));
}

#[test]
fn test_get_unknown_fails() {
    let env = Env::new();
    env.th()
        .args(["get", "no-such-task"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Task not found: no-such-task"));
}

#[test]
fn test_update_unknown_fails_without_creating() {
    let env = Env::new();
    env.th()
        .args(["update", "no-such-task", "error", "--error", "boom"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Task not found"));

    let doc = read_document(&env.store_path());
    assert!(doc.get("no-such-task").is_none());
}

#[test]
fn test_list_filters_by_status() {
    let env = Env::new();
    let first = env.create_json();
    let second = env.create_json();
    let done = first["id"].as_str().unwrap();
    let running = second["id"].as_str().unwrap();

    env.th().args(["update", done, "completed"]).assert().success();

    env.th()
        .args(["list", "--status", "completed"])
        .assert()
        .success()
        .stdout(predicate::str::contains(done))
        .stdout(predicate::str::contains(running).not());

    let output = env.th().args(["list", "--format", "json"]).output().unwrap();
    let records: Vec<Value> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], running);
}

#[test]
fn test_list_empty() {
    let env = Env::new();
    env.th()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No tasks found"));
}

#[test]
fn test_prune_reports_count() {
    let env = Env::new();
    fs::create_dir_all(env.store_path().parent().unwrap()).unwrap();
    fs::write(
        env.store_path(),
        r#"{"ancient": {"status": "completed", "created_at": "2001-01-01T00:00:00Z", "updated_at": "2001-01-01T00:00:00Z"}}"#,
    )
    .unwrap();

    env.th()
        .arg("prune")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pruned 1 task(s)"));
    assert_eq!(read_document(&env.store_path()), serde_json::json!({}));
}

#[test]
fn test_corrupt_store_is_quarantined() {
    let env = Env::new();
    fs::create_dir_all(env.store_path().parent().unwrap()).unwrap();
    fs::write(env.store_path(), "not json at all").unwrap();

    env.th()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No tasks found"));

    let backup = env.dir.path().join("store").join("task_history.json.bak");
    assert_eq!(fs::read_to_string(backup).unwrap(), "not json at all");
}

#[test]
fn test_bad_status_is_rejected() {
    let env = Env::new();
    env.th().args(["update", "t1", "finished"]).assert().failure();
}
