//! The ratchet graph: `baseline → select → red ⇄ red → green ⇄ green → select …
//! → verify`.
//!
//! Red and Green retry by advancing back to themselves with `attempts + 1`,
//! so retry counters are checkpointed like everything else. Each node checks
//! its attempt budget on entry and fails closed once it is spent.

use std::sync::Arc;

use crate::core::budget::AttemptBudget;
use crate::core::ids::NodeRef;
use crate::core::types::{CycleRecord, Phase, StateEnvelope, Transition};
use crate::error::ErrorInfo;
use crate::graph::node::NodeRegistry;

pub mod baseline;
pub mod green;
pub mod red;
pub mod select;
pub mod verify;

pub const BASELINE: &str = "baseline";
pub const SELECT: &str = "select";
pub const RED: &str = "red";
pub const GREEN: &str = "green";
pub const VERIFY: &str = "verify";

pub fn node_ref(name: &'static str) -> NodeRef {
    NodeRef::from_static(name)
}

/// Node every fresh run starts at.
pub fn start_node() -> NodeRef {
    node_ref(BASELINE)
}

/// Policy shared by the ratchet nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSettings {
    pub red_budget: AttemptBudget,
    pub green_budget: AttemptBudget,
    /// Workspace-relative directory holding tests.
    pub tests_dir: String,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            red_budget: AttemptBudget::new(3),
            green_budget: AttemptBudget::new(5),
            tests_dir: "tests".to_string(),
        }
    }
}

/// Register every ratchet node under its stable name.
pub fn build_registry(settings: &CycleSettings) -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    registry
        .register(&node_ref(BASELINE), Arc::new(baseline::BaselineNode))
        .register(&node_ref(SELECT), Arc::new(select::SelectNode))
        .register(
            &node_ref(RED),
            Arc::new(red::RedNode {
                budget: settings.red_budget,
                tests_dir: settings.tests_dir.clone(),
            }),
        )
        .register(
            &node_ref(GREEN),
            Arc::new(green::GreenNode {
                budget: settings.green_budget,
                tests_dir: settings.tests_dir.clone(),
            }),
        )
        .register(&node_ref(VERIFY), Arc::new(verify::VerifyNode));
    registry
}

/// The open cycle, which must be in `phase`.
fn expect_cycle(state: &StateEnvelope, phase: Phase) -> Result<CycleRecord, ErrorInfo> {
    match &state.cycle {
        Some(cycle) if cycle.phase == phase => Ok(cycle.clone()),
        Some(cycle) => Err(ErrorInfo::violation(format!(
            "expected a {phase:?} cycle, found {:?} for {}",
            cycle.phase, cycle.requirement.id
        ))),
        None => Err(ErrorInfo::violation(format!(
            "{phase:?} phase entered without an open cycle"
        ))),
    }
}

/// Loop back into `node` with the attempt counted and the rejection recorded.
fn retry(node: &'static str, mut state: StateEnvelope, feedback: String) -> Transition {
    if let Some(cycle) = state.cycle.as_mut() {
        cycle.attempts += 1;
        cycle.feedback = Some(feedback);
    }
    Transition::advance(&node_ref(node), state)
}
