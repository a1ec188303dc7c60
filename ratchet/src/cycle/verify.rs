//! Hardening: re-run the whole suite at the last committed mark and finish.

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::capability::Capabilities;
use crate::core::types::{RunSummary, StateEnvelope, Transition};
use crate::error::{ErrorInfo, ErrorKind};
use crate::graph::node::Node;

pub struct VerifyNode;

impl Node for VerifyNode {
    #[instrument(name = "verify", skip_all)]
    fn run(&self, state: StateEnvelope, caps: &Capabilities) -> Result<Transition> {
        if let Some(open) = state.open_requirement() {
            return Err(ErrorInfo::violation(format!("cannot verify with cycle {open} open")).into());
        }
        if let Some(mark) = &state.baseline {
            caps.workspace
                .rewind(mark)
                .context("rewind workspace before verification")?;
        }
        let run = caps.tests.run_tests().context("final test run")?;
        if !run.failed.is_empty() {
            let failing: Vec<&str> = run.failed.iter().map(String::as_str).collect();
            return Ok(Transition::failed(
                ErrorKind::RatchetViolation,
                format!("final suite has failing tests: {}", failing.join(", ")),
            ));
        }
        if run.total != state.test_count {
            return Ok(Transition::failed(
                ErrorKind::RatchetViolation,
                format!(
                    "final suite has {} tests but {} were ratcheted in",
                    run.total, state.test_count
                ),
            ));
        }
        info!(cycles = state.cycle_index, tests = run.total, "run verified");
        let summary = RunSummary {
            cycles: state.cycle_index,
            test_count: state.test_count,
            passing: run.passed,
            history: state.history,
        };
        Ok(Transition::Done {
            result: serde_json::to_value(summary).context("serialize run summary")?,
        })
    }
}
