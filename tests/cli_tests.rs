//! End-to-end CLI tests
//!
//! Each test runs the `conductor` binary inside its own temporary directory so the
//! default `.conductor/` state directory never leaks between tests.

use assert_cmd::Command;
use predicates::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tempfile::TempDir;

use agent_conductor::checkpoint::{Checkpoint, SessionSnapshot};
use agent_conductor::{
    Agent, AgentId, CheckpointReason, ExecutionStrategy, Session, SessionId, SessionState,
};

fn plan(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

fn conductor(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("conductor").unwrap();
    cmd.current_dir(dir.path())
        .env("RUST_LOG", "warn")
        .env("CONDUCTOR_SUPERVISION__HEALTH_INTERVAL_MS", "20")
        .env("CONDUCTOR_SUPERVISION__POLL_JITTER_MS", "0");
    cmd
}

#[test]
fn help_lists_commands() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("recover"));
}

#[test]
fn validate_accepts_a_pipeline_plan() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .arg("validate")
        .arg(plan("valid_plan.toml"))
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid"))
        .stdout(predicate::str::contains("Strategy: pipeline"))
        .stdout(predicate::str::contains("qa-1 (1024MB) after architect-1"));

    // Validation never touches the state directory
    assert!(!dir.path().join(".conductor").exists());
}

#[test]
fn validate_rejects_a_dependency_cycle() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .arg("validate")
        .arg(plan("cyclic_plan.toml"))
        .assert()
        .failure()
        .stdout(predicate::str::contains("is invalid"))
        .stdout(predicate::str::contains("cycle"));
}

#[test]
fn validate_reports_a_missing_file() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .arg("validate")
        .arg(plan("does_not_exist.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot read"));
}

#[test]
fn dry_run_completes_and_status_reads_it_back() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .arg("run")
        .arg(plan("quick_plan.json"))
        .arg("--dry-run")
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stdout(predicate::str::contains("created"))
        .stdout(predicate::str::contains("finished: completed"));

    conductor(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("[completed]"))
        .stdout(predicate::str::contains("engineer-1"))
        .stdout(predicate::str::contains("writer-1"));

    // Nothing left to recover
    conductor(&dir)
        .arg("recover")
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("recovered").not());
}

/// Writes a checkpoint for a paused session with one agent that never started.
fn paused_session_on_disk(dir: &TempDir) -> SessionId {
    let session_id = SessionId::from("sess_paused");
    let mut session = Session::new(
        session_id.clone(),
        "waiting for review",
        ExecutionStrategy::Parallel,
        BTreeMap::new(),
    );
    session.state = SessionState::Paused;
    session.agent_count = 1;
    let agent = Agent::pending(AgentId::new("engineer", 1), "engineer", "api", vec![], None, 512);
    let snapshot = SessionSnapshot {
        session,
        agents: vec![agent],
        phases: vec![],
    };
    let checkpoint = Checkpoint::capture(&snapshot, 4, CheckpointReason::SessionTransition).unwrap();

    let session_dir = dir
        .path()
        .join(".conductor")
        .join("checkpoints")
        .join(session_id.as_str());
    std::fs::create_dir_all(&session_dir).unwrap();
    std::fs::write(
        session_dir.join(format!("{:020}-000.checkpoint.json", 4)),
        checkpoint.to_json().unwrap(),
    )
    .unwrap();
    session_id
}

#[test]
fn recover_leaves_a_paused_session_alone_and_exits() {
    let dir = TempDir::new().unwrap();
    let session_id = paused_session_on_disk(&dir);

    conductor(&dir)
        .arg("recover")
        .arg("--dry-run")
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("{session_id} recovered")))
        .stdout(predicate::str::contains(format!("{session_id} left paused")));

    conductor(&dir)
        .arg("status")
        .arg(session_id.as_str())
        .assert()
        .success()
        .stdout(predicate::str::contains("[paused]"))
        .stdout(predicate::str::contains("engineer-1 [pending]"));
}

#[test]
fn status_without_sessions() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No sessions"));
}
