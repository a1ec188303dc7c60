//! CLI tests: spawn the ratchet binary and check exit codes and artifacts.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use ratchet::core::ids::RunId;
use ratchet::cycle::{SELECT, node_ref};
use ratchet::exit_codes;
use ratchet::io::checkpoint::{CheckpointStore, FileCheckpointStore};
use ratchet::io::config::{load_config, write_config};
use ratchet::io::paths::{RatchetPaths, init_workspace};
use ratchet::test_support::{TestRepo, envelope};

fn ratchet(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ratchet"))
        .current_dir(root)
        .args(args)
        .output()
        .expect("spawn ratchet")
}

#[test]
fn init_creates_workspace_and_refuses_to_clobber() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = ratchet(temp.path(), &["init"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let paths = RatchetPaths::new(temp.path());
    assert!(paths.config_path.is_file());
    assert!(paths.checkpoints_dir.is_dir());

    let output = ratchet(temp.path(), &["init"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--force"));

    let output = ratchet(temp.path(), &["init", "--force"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
}

#[test]
fn missing_run_exits_with_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_workspace(temp.path(), false).expect("init");

    for command in ["status", "resume"] {
        let output = ratchet(temp.path(), &[command, "ghost"]);
        assert_eq!(output.status.code(), Some(exit_codes::NOT_FOUND), "{command}");
    }
}

#[test]
fn corrupt_checkpoint_exits_with_corrupt_and_survives() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_workspace(temp.path(), false).expect("init");
    let store = FileCheckpointStore::new(&paths.checkpoints_dir);
    let path = store.path_for(&RunId::new("broken").expect("run id"));
    fs::write(&path, "not json").expect("write");

    for command in ["status", "resume"] {
        let output = ratchet(temp.path(), &[command, "broken"]);
        assert_eq!(output.status.code(), Some(exit_codes::CORRUPT), "{command}");
    }
    assert_eq!(fs::read_to_string(&path).expect("read"), "not json");
}

#[test]
fn status_prints_checkpoint_summary_and_clear_removes_it() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_workspace(temp.path(), false).expect("init");
    let id = RunId::new("calc").expect("run id");
    FileCheckpointStore::new(&paths.checkpoints_dir)
        .save(&id, 0, &node_ref(SELECT), &envelope(&[("add", "adds")]))
        .expect("save");

    let output = ratchet(temp.path(), &["status", "calc"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(status["node"], "select");
    assert_eq!(status["seq"], 1);
    assert_eq!(status["pending"], serde_json::json!(["add"]));

    let output = ratchet(temp.path(), &["clear", "calc"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let output = ratchet(temp.path(), &["status", "calc"]);
    assert_eq!(output.status.code(), Some(exit_codes::NOT_FOUND));
}

#[test]
fn invalid_run_id_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = ratchet(temp.path(), &["status", "../escape"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

/// A plan with no requirements records the baseline and goes straight to
/// verification against a real git workspace and a configured test command.
#[test]
fn start_with_empty_plan_terminates() {
    let repo = TestRepo::new().expect("repo");
    let paths = init_workspace(repo.path(), false).expect("init");
    let mut cfg = load_config(&paths.config_path).expect("config");
    cfg.tests.command = ["sh", "-c", "echo 'test a ... ok'"]
        .map(str::to_string)
        .to_vec();
    write_config(&paths.config_path, &cfg).expect("write config");

    let plans = tempfile::tempdir().expect("tempdir");
    let plan = plans.path().join("plan.toml");
    fs::write(&plan, "specification = \"nothing to add\"\n").expect("write plan");
    let plan_arg = plan.to_string_lossy().into_owned();

    let output = ratchet(repo.path(), &["start", "empty", "--plan", &plan_arg]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{stderr}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("baseline -> select"), "{stdout}");
    assert!(stdout.contains("\"test_count\": 1"), "{stdout}");

    let store = FileCheckpointStore::new(&paths.checkpoints_dir);
    assert!(store.load(&RunId::new("empty").expect("run id")).is_err());
    assert!(paths.run_dir(&RunId::new("empty").expect("run id")).join("steps").is_dir());
}

/// A red suite at start aborts the run; nothing was committed, so there is
/// nothing to resume.
#[test]
fn start_on_failing_suite_exits_aborted() {
    let repo = TestRepo::new().expect("repo");
    let paths = init_workspace(repo.path(), false).expect("init");
    let mut cfg = load_config(&paths.config_path).expect("config");
    cfg.tests.command = ["sh", "-c", "echo 'test a ... FAILED'"]
        .map(str::to_string)
        .to_vec();
    write_config(&paths.config_path, &cfg).expect("write config");
    repo.write("plan.toml", "[[requirements]]\nid = \"add\"\ntext = \"adds\"\n")
        .expect("write plan");

    let output = ratchet(repo.path(), &["start", "red", "--plan", "plan.toml"]);
    assert_eq!(output.status.code(), Some(exit_codes::ABORTED));
    assert!(String::from_utf8_lossy(&output.stderr).contains("ratchet_violation"));
}

/// Without `ratchet init` there is no git-ignored home for checkpoints, so
/// a run is refused before anything is written.
#[test]
fn start_in_uninitialized_root_is_refused() {
    let repo = TestRepo::new().expect("repo");
    repo.write("plan.toml", "[[requirements]]\nid = \"add\"\ntext = \"adds\"\n")
        .expect("write plan");

    let output = ratchet(repo.path(), &["start", "calc", "--plan", "plan.toml"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("ratchet init"));
    assert!(!repo.path().join(".ratchet").exists());
}
