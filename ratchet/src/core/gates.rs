//! Inventory-lock and coverage-lock checks.
//!
//! Pure functions over observed test runs. The ratchet nodes gather the
//! observations through capabilities and hand them here; a violation is
//! recoverable feedback for the next attempt, not an error by itself.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::core::types::{CompileVerdict, CoverageResult, SourceLine, TestRunResult};

/// A failed lock check. `Display` is the feedback handed to the next attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockViolation {
    #[error("test set does not compile:\n{0}")]
    CompileError(String),

    #[error("expected exactly {expected} tests after adding one, runner reported {found}")]
    CountMismatch { expected: u32, found: u32 },

    #[error("tests present before the cycle are gone: {}", .tests.join(", "))]
    TestsRemoved { tests: Vec<String> },

    #[error("new test {test} was not reported by the test runner")]
    NewTestMissing { test: String },

    #[error("new test {test} passes against the current implementation; it must fail first")]
    NewTestPassed { test: String },

    #[error("test inventory changed during implementation: expected {expected} tests, found {found}")]
    InventoryChanged { expected: u32, found: u32 },

    #[error("test {test} still fails:\n{output}")]
    StillFailing { test: String, output: String },

    #[error("previously passing tests now fail: {}", .tests.join(", "))]
    Regression { tests: Vec<String> },

    #[error("added lines not executed by {test}: {}", render_lines(.lines))]
    Uncovered { test: String, lines: Vec<SourceLine> },
}

fn render_lines(lines: &[SourceLine]) -> String {
    lines
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Red-phase gate: the test set compiles, is the pre-cycle inventory plus
/// exactly one test, the earlier tests still pass, and the new test fails
/// against the pre-fix implementation.
pub fn check_inventory_lock(
    pre_count: u32,
    pre_tests: &BTreeSet<String>,
    test_id: &str,
    compile: &CompileVerdict,
    run: &TestRunResult,
) -> Result<(), LockViolation> {
    if let CompileVerdict::Error(output) = compile {
        return Err(LockViolation::CompileError(output.clone()));
    }
    let removed: Vec<String> = pre_tests
        .iter()
        .filter(|name| !run.passed.contains(*name) && !run.failed.contains(*name))
        .cloned()
        .collect();
    if !removed.is_empty() {
        return Err(LockViolation::TestsRemoved { tests: removed });
    }
    let expected = pre_count + 1;
    if run.total != expected {
        return Err(LockViolation::CountMismatch {
            expected,
            found: run.total,
        });
    }
    if run.passed.contains(test_id) {
        return Err(LockViolation::NewTestPassed {
            test: test_id.to_string(),
        });
    }
    if !run.failed.contains(test_id) {
        return Err(LockViolation::NewTestMissing {
            test: test_id.to_string(),
        });
    }
    let broken: Vec<String> = pre_tests
        .iter()
        .filter(|name| run.failed.contains(*name))
        .cloned()
        .collect();
    if !broken.is_empty() {
        return Err(LockViolation::Regression { tests: broken });
    }
    Ok(())
}

/// Green-phase run gate: inventory frozen, the cycle's test passes, and
/// every test passing before the cycle still passes.
pub fn check_green_run(
    expected_total: u32,
    test_id: &str,
    pre_passing: &BTreeSet<String>,
    run: &TestRunResult,
) -> Result<(), LockViolation> {
    if run.total != expected_total {
        return Err(LockViolation::InventoryChanged {
            expected: expected_total,
            found: run.total,
        });
    }
    if !run.passed.contains(test_id) {
        return Err(LockViolation::StillFailing {
            test: test_id.to_string(),
            output: run.output.clone(),
        });
    }
    let regressed: Vec<String> = pre_passing
        .iter()
        .filter(|name| !run.passed.contains(*name))
        .cloned()
        .collect();
    if !regressed.is_empty() {
        return Err(LockViolation::Regression { tests: regressed });
    }
    Ok(())
}

/// Green-phase coverage gate: every added line was executed by the cycle's
/// test.
pub fn check_coverage(
    test_id: &str,
    added: &BTreeSet<SourceLine>,
    coverage: &CoverageResult,
) -> Result<(), LockViolation> {
    let uncovered: Vec<SourceLine> = added
        .difference(&coverage.executed_lines)
        .cloned()
        .collect();
    if uncovered.is_empty() {
        return Ok(());
    }
    Err(LockViolation::Uncovered {
        test: test_id.to_string(),
        lines: uncovered,
    })
}
