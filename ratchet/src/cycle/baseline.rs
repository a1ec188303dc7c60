//! Establish the starting inventory: the suite must be green before any
//! cycle can ratchet against it.

use anyhow::Result;
use tracing::{info, instrument};

use crate::capability::Capabilities;
use crate::core::types::{HistoryEntry, StateEnvelope, Transition};
use crate::cycle::{BASELINE, SELECT, node_ref};
use crate::error::ErrorKind;
use crate::graph::node::Node;

pub struct BaselineNode;

impl Node for BaselineNode {
    #[instrument(name = "baseline", skip_all)]
    fn run(&self, state: StateEnvelope, caps: &Capabilities) -> Result<Transition> {
        let run = caps.tests.run_tests()?;
        if !run.failed.is_empty() {
            let failing: Vec<&str> = run.failed.iter().map(String::as_str).collect();
            return Ok(Transition::failed(
                ErrorKind::RatchetViolation,
                format!("baseline suite is not green: {}", failing.join(", ")),
            ));
        }
        let mark = caps.workspace.mark("ratchet: baseline")?;
        info!(tests = run.total, mark = mark.as_str(), "baseline recorded");

        let mut next = state;
        next.test_count = run.total;
        next.passing = run.passed;
        next.baseline = Some(mark.clone());
        next.history.push(HistoryEntry {
            node: node_ref(BASELINE),
            cycle: next.cycle_index,
            requirement: None,
            test: None,
            attempts: 0,
            mark: Some(mark),
            summary: format!("{} existing tests passing", next.test_count),
        });
        Ok(Transition::advance(&node_ref(SELECT), next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::WorkspaceMark;
    use crate::test_support::{SimProject, ScriptedRoles, envelope};

    #[test]
    fn records_existing_suite() {
        let project = SimProject::new();
        project.seed("src/lib.rs", "fn sub\n  body\n");
        project.seed("tests/sub.t", "assert sub\n");
        let caps = ScriptedRoles::default().capabilities(&project);

        let transition = BaselineNode
            .run(envelope(&[("add", "add numbers")]), &caps)
            .expect("run");
        let Transition::Advance { next, state } = transition else {
            panic!("expected advance, got {transition:?}");
        };
        assert_eq!(next.as_str(), "select");
        assert_eq!(state.test_count, 1);
        assert!(state.passing.contains("sub"));
        assert_eq!(state.baseline, Some(WorkspaceMark("m1".to_string())));
    }

    #[test]
    fn red_suite_fails_closed() {
        let project = SimProject::new();
        project.seed("tests/broken.t", "assert missing\n");
        let caps = ScriptedRoles::default().capabilities(&project);

        let transition = BaselineNode
            .run(envelope(&[]), &caps)
            .expect("run");
        match transition {
            Transition::Failed { error } => {
                assert_eq!(error.kind, ErrorKind::RatchetViolation);
                assert!(error.message.contains("broken"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
