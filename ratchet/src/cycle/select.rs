//! Open the next cycle, or hand off to verification when nothing is pending.

use anyhow::Result;
use tracing::{debug, instrument};

use crate::capability::Capabilities;
use crate::core::types::{CycleRecord, StateEnvelope, Transition};
use crate::cycle::{RED, VERIFY, node_ref};
use crate::error::ErrorInfo;
use crate::graph::node::Node;

pub struct SelectNode;

impl Node for SelectNode {
    #[instrument(name = "select", skip_all, fields(pending = state.pending.len()))]
    fn run(&self, state: StateEnvelope, _caps: &Capabilities) -> Result<Transition> {
        if let Some(open) = state.open_requirement() {
            return Err(ErrorInfo::violation(format!("cycle for {open} is still open")).into());
        }
        let mut next = state;
        let Some(requirement) = next.pending.pop_front() else {
            debug!("no pending requirements");
            return Ok(Transition::advance(&node_ref(VERIFY), next));
        };
        debug!(requirement = %requirement.id, "opening cycle");
        next.cycle = Some(CycleRecord::open(
            requirement,
            next.test_count,
            next.passing.clone(),
        ));
        Ok(Transition::advance(&node_ref(RED), next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Phase;
    use crate::test_support::{SimProject, ScriptedRoles, envelope};

    #[test]
    fn opens_cycle_for_first_pending_requirement() {
        let project = SimProject::new();
        let caps = ScriptedRoles::default().capabilities(&project);
        let mut state = envelope(&[("add", "add numbers"), ("sub", "subtract")]);
        state.test_count = 2;
        state.passing = ["a".to_string(), "b".to_string()].into_iter().collect();

        let Transition::Advance { next, state } = SelectNode.run(state, &caps).expect("run") else {
            panic!("expected advance");
        };
        assert_eq!(next.as_str(), "red");
        let cycle = state.cycle.expect("cycle");
        assert_eq!(cycle.phase, Phase::Red);
        assert_eq!(cycle.requirement.id, "add");
        assert_eq!(cycle.pre_test_count, 2);
        assert_eq!(cycle.pre_passing.len(), 2);
        assert_eq!(state.pending.len(), 1);
    }

    #[test]
    fn empty_queue_goes_to_verify() {
        let project = SimProject::new();
        let caps = ScriptedRoles::default().capabilities(&project);
        let Transition::Advance { next, .. } = SelectNode.run(envelope(&[]), &caps).expect("run")
        else {
            panic!("expected advance");
        };
        assert_eq!(next.as_str(), "verify");
    }
}
