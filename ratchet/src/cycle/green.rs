//! Green phase: the minimal fix, fully exercised by the cycle's test.
//!
//! The implementer only ever sees the failure text captured in Red. Each
//! attempt starts from the Red mark; a rejected attempt loops back into
//! Green with the reason as feedback until the attempt budget is spent.

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::capability::{Capabilities, ImplementerBrief};
use crate::core::budget::AttemptBudget;
use crate::core::gates::{check_coverage, check_green_run};
use crate::core::ids::NodeRef;
use crate::core::invariants::{validate_envelope, validate_green_commit, validate_retry};
use crate::core::scope::check_implementer_edits;
use crate::core::types::{HistoryEntry, Phase, StateEnvelope, Transition};
use crate::cycle::{GREEN, SELECT, expect_cycle, node_ref, retry};
use crate::error::{ErrorInfo, ErrorKind};
use crate::graph::node::Node;

pub struct GreenNode {
    pub budget: AttemptBudget,
    pub tests_dir: String,
}

impl Node for GreenNode {
    #[instrument(name = "green", skip_all, fields(cycle = state.cycle_index + 1))]
    fn run(&self, mut state: StateEnvelope, caps: &Capabilities) -> Result<Transition> {
        let cycle = expect_cycle(&state, Phase::Green)?;
        if let Err(exhausted) = self.budget.remaining(cycle.attempts) {
            return Ok(Transition::failed(
                ErrorKind::RatchetViolation,
                format!(
                    "green phase for {} gave up: {exhausted}; last rejection: {}",
                    cycle.requirement.id,
                    cycle.feedback.as_deref().unwrap_or("none")
                ),
            ));
        }
        let (Some(test), Some(red_mark)) = (cycle.test.clone(), cycle.red_mark.clone()) else {
            return Err(ErrorInfo::violation("green cycle is missing its test or red mark").into());
        };
        caps.workspace
            .rewind(&red_mark)
            .context("rewind workspace before green attempt")?;

        let modification = caps
            .implementer
            .implement(&ImplementerBrief {
                failure_message: cycle.failure_output.clone().unwrap_or_default(),
                feedback: cycle.feedback.clone(),
            })
            .context("implementer")?;
        if let Err(violation) = check_implementer_edits(&self.tests_dir, &modification.edits) {
            warn!(%violation, "implementer wrote outside its scope");
            return Ok(retry(GREEN, state, violation.to_string()));
        }
        caps.workspace
            .apply(&modification.edits)
            .context("apply implementer edits")?;

        let added = caps
            .workspace
            .added_lines(&red_mark)
            .context("diff against red mark")?;
        let run = caps.tests.run_tests().context("run tests after fix")?;
        if let Some(open) = state.cycle.as_mut() {
            open.added_lines = added.clone();
            open.coverage.clear();
        }
        if let Err(violation) = check_green_run(state.test_count, &test.id, &cycle.pre_passing, &run) {
            warn!(%violation, "green run rejected");
            return Ok(retry(GREEN, state, violation.to_string()));
        }
        let coverage = caps
            .coverage
            .measure(&added, &test.id)
            .context("measure coverage")?;
        if let Some(open) = state.cycle.as_mut() {
            open.coverage = coverage.executed_lines.clone();
        }
        if let Err(violation) = check_coverage(&test.id, &added, &coverage) {
            warn!(%violation, "coverage lock rejected fix");
            return Ok(retry(GREEN, state, violation.to_string()));
        }

        let mark = caps
            .workspace
            .mark(&format!(
                "ratchet: green {} ({})",
                state.cycle_index + 1,
                cycle.requirement.id
            ))
            .context("commit green fix")?;
        info!(
            test = %test.id,
            added = added.len(),
            mark = mark.as_str(),
            "green committed"
        );

        let mut next = state;
        next.cycle_index += 1;
        next.baseline = Some(mark.clone());
        next.passing = run.passed;
        next.cycle = None;
        next.history.push(HistoryEntry {
            node: node_ref(GREEN),
            cycle: next.cycle_index,
            requirement: Some(cycle.requirement.id.clone()),
            test: Some(test.id),
            attempts: cycle.attempts,
            mark: Some(mark),
            summary: format!(
                "{} added lines, {} executed by the cycle test",
                added.len(),
                coverage.executed_lines.len()
            ),
        });
        Ok(Transition::advance(&node_ref(SELECT), next))
    }

    fn validate_advance(&self, prev: &StateEnvelope, next: &NodeRef, state: &StateEnvelope) -> Vec<String> {
        let mut errors = validate_envelope(state);
        match next.as_str() {
            GREEN => errors.extend(validate_retry(prev, state)),
            SELECT => errors.extend(validate_green_commit(prev, state)),
            other => errors.push(format!("green may not advance to {other}")),
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FileEdit;
    use crate::test_support::{SimProject, ScriptedRoles, envelope_in_green};

    fn node() -> GreenNode {
        GreenNode {
            budget: AttemptBudget::new(5),
            tests_dir: "tests".to_string(),
        }
    }

    /// Scenario: the one added line is executed by the cycle test and nothing
    /// regresses, so the cycle closes and the index advances 0 -> 1.
    #[test]
    fn commits_fully_covered_fix() {
        let project = SimProject::new();
        project.seed("src/lib.rs", "");
        let state = envelope_in_green(&project, "adds", "assert add");
        let roles = ScriptedRoles::default().implementer(vec![FileEdit::write("src/lib.rs", "fn add\n")]);
        let caps = roles.capabilities(&project);

        let prev = state.clone();
        let Transition::Advance { next, state } = node().run(state, &caps).expect("run") else {
            panic!("expected advance");
        };
        assert_eq!(next.as_str(), "select");
        assert_eq!(state.cycle_index, 1);
        assert!(state.cycle.is_none());
        assert!(state.passing.contains("adds"));
        assert!(node().validate_advance(&prev, &next, &state).is_empty());
        let entry = state.history.last().expect("history");
        assert_eq!(entry.summary, "1 added lines, 1 executed by the cycle test");
    }

    /// Scenario: an unreachable branch leaves an added line unexecuted; the
    /// fix is rejected and the implementer gets the uncovered location.
    #[test]
    fn uncovered_line_is_rejected_with_location() {
        let project = SimProject::new();
        project.seed("src/lib.rs", "");
        let state = envelope_in_green(&project, "adds", "assert add");
        let roles = ScriptedRoles::default().implementer(vec![FileEdit::write(
            "src/lib.rs",
            "fn add\n  sum\n  unreachable overflow\n",
        )]);
        let caps = roles.capabilities(&project);

        let Transition::Advance { next, state } = node().run(state, &caps).expect("run") else {
            panic!("expected advance");
        };
        assert_eq!(next.as_str(), "green");
        let cycle = state.cycle.expect("cycle");
        assert_eq!(cycle.attempts, 1);
        assert_eq!(
            cycle.feedback.as_deref(),
            Some("added lines not executed by adds: src/lib.rs:3")
        );
        assert_eq!(cycle.added_lines.len(), 3);
        assert_eq!(cycle.coverage.len(), 2);
    }

    #[test]
    fn regression_is_rejected() {
        let project = SimProject::new();
        project.seed("src/lib.rs", "fn sub\n");
        project.seed("tests/subs.t", "assert sub\n");
        let state = envelope_in_green(&project, "adds", "assert add");
        let roles = ScriptedRoles::default().implementer(vec![FileEdit::write("src/lib.rs", "fn add\n")]);
        let caps = roles.capabilities(&project);

        let Transition::Advance { next, state } = node().run(state, &caps).expect("run") else {
            panic!("expected advance");
        };
        assert_eq!(next.as_str(), "green");
        let feedback = state.cycle.and_then(|c| c.feedback).unwrap_or_default();
        assert_eq!(feedback, "previously passing tests now fail: subs");
    }

    #[test]
    fn touching_tests_is_rejected_before_applying() {
        let project = SimProject::new();
        project.seed("src/lib.rs", "");
        let state = envelope_in_green(&project, "adds", "assert add");
        let roles = ScriptedRoles::default().implementer(vec![FileEdit::delete("tests/adds.t")]);
        let caps = roles.capabilities(&project);

        let Transition::Advance { next, .. } = node().run(state, &caps).expect("run") else {
            panic!("expected advance");
        };
        assert_eq!(next.as_str(), "green");
        assert!(project.file("tests/adds.t").is_some());
    }

    /// The implementer brief is built from the captured failure text only.
    #[test]
    fn implementer_sees_failure_text_not_test_source() {
        let project = SimProject::new();
        project.seed("src/lib.rs", "");
        let state = envelope_in_green(&project, "adds", "assert add");
        let roles = ScriptedRoles::default().implementer(vec![FileEdit::write("src/lib.rs", "fn add\n")]);
        let caps = roles.capabilities(&project);

        node().run(state, &caps).expect("run");
        let briefs = roles.implementer_briefs();
        assert_eq!(briefs.len(), 1);
        assert!(briefs[0].failure_message.contains("add is not defined"));
        assert!(!briefs[0].failure_message.contains("assert add"));
    }
}
