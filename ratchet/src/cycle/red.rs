//! Red phase: add exactly one new test that fails against the current code.
//!
//! Steps, each attempt:
//! 1. rewind to the last committed mark
//! 2. tester writes one test (requirement + public signatures only)
//! 3. reviewer checks the test matches the requirement
//! 4. the test is written and the inventory lock is checked
//!
//! Any rejection loops back into Red with the reason as feedback until the
//! attempt budget is spent.

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::capability::{Capabilities, MatchVerdict, ReviewBrief, TesterBrief};
use crate::core::budget::AttemptBudget;
use crate::core::gates::check_inventory_lock;
use crate::core::ids::NodeRef;
use crate::core::invariants::{validate_envelope, validate_red_commit, validate_retry};
use crate::core::scope::check_tester_path;
use crate::core::types::{FileEdit, HistoryEntry, Phase, StateEnvelope, Transition};
use crate::cycle::{GREEN, RED, expect_cycle, node_ref, retry};
use crate::error::{ErrorInfo, ErrorKind};
use crate::graph::node::Node;

pub struct RedNode {
    pub budget: AttemptBudget,
    pub tests_dir: String,
}

impl Node for RedNode {
    #[instrument(name = "red", skip_all, fields(cycle = state.cycle_index + 1))]
    fn run(&self, state: StateEnvelope, caps: &Capabilities) -> Result<Transition> {
        let cycle = expect_cycle(&state, Phase::Red)?;
        if let Err(exhausted) = self.budget.remaining(cycle.attempts) {
            return Ok(Transition::failed(
                ErrorKind::RatchetViolation,
                format!(
                    "red phase for {} gave up: {exhausted}; last rejection: {}",
                    cycle.requirement.id,
                    cycle.feedback.as_deref().unwrap_or("none")
                ),
            ));
        }
        let baseline = state
            .baseline
            .clone()
            .ok_or_else(|| ErrorInfo::violation("red phase entered before a baseline was recorded"))?;
        caps.workspace
            .rewind(&baseline)
            .context("rewind workspace before red attempt")?;

        let test = caps
            .tester
            .write_test(&TesterBrief {
                requirement: cycle.requirement.clone(),
                public_signatures: state.public_signatures.clone(),
                fixtures: state.fixtures.clone(),
                tests_dir: self.tests_dir.clone(),
                feedback: cycle.feedback.clone(),
            })
            .context("tester")?;
        if let Err(violation) = check_tester_path(&self.tests_dir, &test.path) {
            warn!(%violation, "tester wrote outside its scope");
            return Ok(retry(RED, state, violation.to_string()));
        }

        let verdict = caps
            .reviewer
            .review(&ReviewBrief {
                requirement: cycle.requirement.clone(),
                test: test.clone(),
            })
            .context("reviewer")?;
        if let MatchVerdict::Reject { reason } = verdict {
            info!(test = %test.id, %reason, "reviewer rejected test");
            return Ok(retry(RED, state, format!("reviewer rejected the test: {reason}")));
        }

        caps.workspace
            .apply(&[FileEdit::write(&test.path, &test.source)])
            .context("write test into workspace")?;
        let compile = caps.compiler.check(&test).context("compile check")?;
        let run = caps.tests.run_tests().context("run tests after adding test")?;
        if let Err(violation) = check_inventory_lock(
            cycle.pre_test_count,
            &cycle.pre_passing,
            &test.id,
            &compile,
            &run,
        ) {
            warn!(%violation, "inventory lock rejected test");
            return Ok(retry(RED, state, violation.to_string()));
        }

        let mark = caps
            .workspace
            .mark(&format!(
                "ratchet: red {} ({})",
                state.cycle_index + 1,
                cycle.requirement.id
            ))
            .context("commit red test")?;
        info!(test = %test.id, mark = mark.as_str(), "red committed");

        let mut next = state;
        next.test_count += 1;
        next.history.push(HistoryEntry {
            node: node_ref(RED),
            cycle: next.cycle_index + 1,
            requirement: Some(cycle.requirement.id.clone()),
            test: Some(test.id.clone()),
            attempts: cycle.attempts,
            mark: Some(mark.clone()),
            summary: format!("added failing test {}", test.id),
        });
        let mut green = cycle;
        green.phase = Phase::Green;
        green.test = Some(test);
        green.failure_output = Some(run.output);
        green.red_mark = Some(mark);
        green.attempts = 0;
        green.feedback = None;
        next.cycle = Some(green);
        Ok(Transition::advance(&node_ref(GREEN), next))
    }

    fn validate_advance(&self, prev: &StateEnvelope, next: &NodeRef, state: &StateEnvelope) -> Vec<String> {
        let mut errors = validate_envelope(state);
        match next.as_str() {
            RED => errors.extend(validate_retry(prev, state)),
            GREEN => errors.extend(validate_red_commit(prev, state)),
            other => errors.push(format!("red may not advance to {other}")),
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::*;
    use crate::capability::TestRunner;
    use crate::core::types::TestRunResult;
    use crate::test_support::{SimProject, ScriptedRoles, envelope_in_red, sim_test};

    /// Runner reporting a fixed inventory regardless of the workspace.
    struct Reports(TestRunResult);

    impl TestRunner for Reports {
        fn run_tests(&self) -> Result<TestRunResult> {
            Ok(self.0.clone())
        }
    }

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn setup() -> (SimProject, StateEnvelope) {
        let project = SimProject::new();
        project.seed("src/lib.rs", "");
        let state = envelope_in_red(&project, "add", "add(2,3) returns 5");
        (project, state)
    }

    /// Scenario: the new test fails against an empty implementation, so Red
    /// commits with the test count going 0 -> 1.
    #[test]
    fn commits_single_failing_test() {
        let (project, state) = setup();
        let roles = ScriptedRoles::default().tester(sim_test("adds", "assert add"));
        let caps = roles.capabilities(&project);

        let node = RedNode {
            budget: AttemptBudget::new(3),
            tests_dir: "tests".to_string(),
        };
        let prev = state.clone();
        let Transition::Advance { next, state } = node.run(state, &caps).expect("run") else {
            panic!("expected advance");
        };
        assert_eq!(next.as_str(), "green");
        assert_eq!(state.test_count, 1);
        let cycle = state.cycle.as_ref().expect("cycle");
        assert_eq!(cycle.phase, Phase::Green);
        assert!(cycle.failure_output.as_deref().unwrap_or_default().contains("add"));
        assert!(node.validate_advance(&prev, &next, &state).is_empty());
        assert_eq!(project.file("tests/adds.t").as_deref(), Some("assert add\n"));
    }

    /// Scenario: the reviewer rejects the test; Red loops with the test count
    /// unchanged and the attempt counted.
    #[test]
    fn reviewer_rejection_loops_without_counting_a_test() {
        let (project, state) = setup();
        let roles = ScriptedRoles::default()
            .tester(sim_test("logs", "assert log"))
            .reject("asserts an undocumented side effect");
        let caps = roles.capabilities(&project);
        let node = RedNode {
            budget: AttemptBudget::new(3),
            tests_dir: "tests".to_string(),
        };

        let prev = state.clone();
        let Transition::Advance { next, state } = node.run(state, &caps).expect("run") else {
            panic!("expected advance");
        };
        assert_eq!(next.as_str(), "red");
        assert_eq!(state.test_count, 0);
        let cycle = state.cycle.as_ref().expect("cycle");
        assert_eq!(cycle.attempts, 1);
        assert!(
            cycle
                .feedback
                .as_deref()
                .unwrap_or_default()
                .contains("undocumented side effect")
        );
        assert!(node.validate_advance(&prev, &next, &state).is_empty());
        assert!(project.file("tests/logs.t").is_none());
    }

    #[test]
    fn passing_test_is_rejected_by_inventory_lock() {
        let project = SimProject::new();
        project.seed("src/lib.rs", "fn add\n");
        let state = envelope_in_red(&project, "add", "add(2,3) returns 5");
        let roles = ScriptedRoles::default().tester(sim_test("adds", "assert add"));
        let caps = roles.capabilities(&project);
        let node = RedNode {
            budget: AttemptBudget::new(3),
            tests_dir: "tests".to_string(),
        };

        let Transition::Advance { next, state } = node.run(state, &caps).expect("run") else {
            panic!("expected advance");
        };
        assert_eq!(next.as_str(), "red");
        let feedback = state.cycle.and_then(|c| c.feedback).unwrap_or_default();
        assert!(feedback.contains("must fail first"), "{feedback}");
    }

    /// A rewritten test file that drops `old` and adds `new` plus `extra` still
    /// grows the count by one, but it is not a single added test.
    #[test]
    fn replacing_an_existing_test_is_rejected() {
        let project = SimProject::new();
        project.seed("src/lib.rs", "fn sub\n");
        project.seed("tests/old.t", "assert sub\n");
        let state = envelope_in_red(&project, "add", "add(2,3) returns 5");
        let roles = ScriptedRoles::default().tester(sim_test("new", "assert add"));
        let mut caps = roles.capabilities(&project);
        caps.tests = Arc::new(Reports(TestRunResult::from_sets(
            names(&["extra"]),
            names(&["new"]),
            "ok extra\nFAILED new\n".to_string(),
        )));
        let node = RedNode {
            budget: AttemptBudget::new(3),
            tests_dir: "tests".to_string(),
        };

        let Transition::Advance { next, state } = node.run(state, &caps).expect("run") else {
            panic!("expected advance");
        };
        assert_eq!(next.as_str(), "red");
        assert_eq!(state.test_count, 1);
        let feedback = state.cycle.and_then(|c| c.feedback).unwrap_or_default();
        assert!(feedback.contains("are gone: old"), "{feedback}");
    }

    #[test]
    fn tester_writing_outside_tests_dir_is_rejected() {
        let (project, state) = setup();
        let mut test = sim_test("adds", "assert add");
        test.path = "src/sneaky.t".to_string();
        let roles = ScriptedRoles::default().tester(test);
        let caps = roles.capabilities(&project);
        let node = RedNode {
            budget: AttemptBudget::new(3),
            tests_dir: "tests".to_string(),
        };

        let Transition::Advance { next, .. } = node.run(state, &caps).expect("run") else {
            panic!("expected advance");
        };
        assert_eq!(next.as_str(), "red");
        assert_eq!(roles.reviewer_calls(), 0);
    }

    #[test]
    fn exhausted_budget_fails_closed_without_calling_tester() {
        let (project, mut state) = setup();
        if let Some(cycle) = state.cycle.as_mut() {
            cycle.attempts = 2;
            cycle.feedback = Some("reviewer rejected the test: vague".to_string());
        }
        let roles = ScriptedRoles::default();
        let caps = roles.capabilities(&project);
        let node = RedNode {
            budget: AttemptBudget::new(2),
            tests_dir: "tests".to_string(),
        };

        match node.run(state, &caps).expect("run") {
            Transition::Failed { error } => {
                assert_eq!(error.kind, ErrorKind::RatchetViolation);
                assert!(error.message.contains("vague"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(roles.tester_calls(), 0);
    }
}
