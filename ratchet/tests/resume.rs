//! Crash recovery: runs interrupted after a committed checkpoint resume at
//! the next node without repeating committed work, and damaged checkpoints
//! are reported instead of discarded.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use ratchet::core::ids::{NodeRef, RunId};
use ratchet::core::types::{FileEdit, Phase, StateEnvelope};
use ratchet::cycle::{CycleSettings, build_registry, start_node};
use ratchet::error::{ErrorKind, RunError};
use ratchet::graph::{ExecutorOptions, GraphExecutor, RunOutcome, StepEvent};
use ratchet::io::checkpoint::{CheckpointStore, FileCheckpointStore};
use ratchet::test_support::{ScriptedRoles, SimProject, envelope, sim_test};

fn executor(dir: &Path, roles: &ScriptedRoles, project: &SimProject) -> GraphExecutor {
    GraphExecutor::new(
        build_registry(&CycleSettings::default()),
        Arc::new(FileCheckpointStore::new(dir)),
        roles.capabilities(project),
        ExecutorOptions::default(),
    )
}

fn run_id(id: &str) -> RunId {
    RunId::new(id).expect("run id")
}

fn initial() -> StateEnvelope {
    envelope(&[("add", "add(2,3) returns 5")])
}

fn full_roles() -> ScriptedRoles {
    ScriptedRoles::default()
        .tester(sim_test("adds", "assert add"))
        .implementer(vec![FileEdit::write("src/lib.rs", "fn add\n")])
}

fn uninterrupted() -> (RunOutcome, usize) {
    let temp = tempfile::tempdir().expect("tempdir");
    let project = SimProject::new();
    let roles = full_roles();
    let outcome = executor(temp.path(), &roles, &project)
        .start_run(&run_id("calc"), &start_node(), initial())
        .expect("start")
        .run(|_| {});
    (outcome, project.test_runs())
}

/// Killed right after the Red commit: resume picks up at Green with the
/// failing-test record and never calls the tester again. The terminal result
/// matches an uninterrupted run, and no committed node runs twice.
#[test]
fn resume_after_red_commit_skips_tester() {
    let temp = tempfile::tempdir().expect("tempdir");
    let project = SimProject::new();
    let id = run_id("calc");

    let first = full_roles();
    {
        let exec = executor(temp.path(), &first, &project);
        let mut handle = exec.start_run(&id, &start_node(), initial()).expect("start");
        loop {
            let report = handle.step().expect("step");
            if report.event
                == (StepEvent::Advanced {
                    next: NodeRef::new("green").expect("node"),
                })
            {
                break;
            }
        }
        // handle and executor dropped here: equivalent to a crash
    }
    assert_eq!(first.tester_calls(), 1);
    assert_eq!(first.implementer_calls(), 0);

    let checkpoint = FileCheckpointStore::new(temp.path()).load(&id).expect("checkpoint");
    assert_eq!(checkpoint.node.as_str(), "green");
    assert_eq!(checkpoint.seq, 3);

    let second = ScriptedRoles::default().implementer(vec![FileEdit::write("src/lib.rs", "fn add\n")]);
    let exec = executor(temp.path(), &second, &project);
    let handle = exec.resume_run(&id).expect("resume");
    assert!(handle.resumed());
    assert_eq!(handle.seq(), 3);
    let (node, state) = handle.current().expect("running");
    assert_eq!(node.as_str(), "green");
    let cycle = state.cycle.as_ref().expect("cycle");
    assert_eq!(cycle.phase, Phase::Green);
    assert_eq!(cycle.test.as_ref().map(|t| t.id.as_str()), Some("adds"));

    let outcome = handle.run(|_| {});
    assert_eq!(second.tester_calls(), 0);
    assert_eq!(second.reviewer_calls(), 0);
    assert_eq!(second.implementer_calls(), 1);

    let (expected, expected_runs) = uninterrupted();
    assert_eq!(outcome, expected);
    assert_eq!(project.test_runs(), expected_runs);
}

/// `start_run` on a run that already has a checkpoint resumes it and ignores
/// the initial state it was handed.
#[test]
fn start_on_existing_checkpoint_resumes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let project = SimProject::new();
    let id = run_id("calc");
    let first = full_roles();
    {
        let exec = executor(temp.path(), &first, &project);
        let mut handle = exec.start_run(&id, &start_node(), initial()).expect("start");
        handle.step().expect("baseline");
    }

    let exec = executor(temp.path(), &full_roles(), &project);
    let handle = exec
        .start_run(&id, &start_node(), envelope(&[("other", "ignored")]))
        .expect("start");
    assert!(handle.resumed());
    let (node, state) = handle.current().expect("running");
    assert_eq!(node.as_str(), "select");
    assert_eq!(state.pending.front().map(|r| r.id.as_str()), Some("add"));
}

#[test]
fn resume_without_checkpoint_is_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let exec = executor(temp.path(), &ScriptedRoles::default(), &SimProject::new());
    let Err(err) = exec.resume_run(&run_id("ghost")) else {
        panic!("expected not found");
    };
    assert!(matches!(err, RunError::NotFound(_)));
    assert_eq!(err.kind(), ErrorKind::IoFailure);
}

/// A checkpoint damaged on disk is reported as corrupt and left byte for
/// byte as it was.
#[test]
fn corrupt_checkpoint_is_reported_and_left_untouched() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = FileCheckpointStore::new(temp.path());
    let id = run_id("calc");
    let path = store.path_for(&id);
    fs::write(&path, b"{\"format\": 1, \"run_id\": \"calc\", \"seq\": ").expect("write");
    let before = fs::read(&path).expect("read");

    let exec = executor(temp.path(), &ScriptedRoles::default(), &SimProject::new());
    let Err(err) = exec.resume_run(&id) else {
        panic!("expected corrupt data");
    };
    assert!(matches!(err, RunError::CorruptData { .. }), "{err}");
    assert_eq!(err.kind(), ErrorKind::CorruptData);
    assert_eq!(fs::read(&path).expect("read"), before);

    // starting fresh under the same id must not paper over it either
    let Err(err) = exec.start_run(&id, &start_node(), initial()) else {
        panic!("expected corrupt data");
    };
    assert!(matches!(err, RunError::CorruptData { .. }));
    assert_eq!(fs::read(&path).expect("read"), before);
}

/// A well-formed record naming a node this build does not know is just as
/// unresumable.
#[test]
fn checkpoint_naming_unknown_node_is_corrupt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = FileCheckpointStore::new(temp.path());
    let id = run_id("calc");
    store
        .save(&id, 0, &NodeRef::new("harden").expect("node"), &initial())
        .expect("save");
    let before = fs::read(store.path_for(&id)).expect("read");

    let exec = executor(temp.path(), &ScriptedRoles::default(), &SimProject::new());
    let Err(err) = exec.resume_run(&id) else {
        panic!("expected corrupt data");
    };
    assert!(err.to_string().contains("harden"), "{err}");
    assert_eq!(err.kind(), ErrorKind::CorruptData);
    assert_eq!(fs::read(store.path_for(&id)).expect("read"), before);
}
