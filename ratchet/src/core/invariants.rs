//! Structural validation of envelopes and of the transitions between them.
//!
//! Each check returns a list of human-readable violations; an empty list means
//! the envelope (or transition) is consistent. The executor refuses to commit
//! a checkpoint for a transition that fails these checks.

use crate::core::types::{Phase, StateEnvelope};

/// Internal consistency of a single envelope.
pub fn validate_envelope(state: &StateEnvelope) -> Vec<String> {
    let mut errors = Vec::new();
    let passing = state.passing.len();
    if passing > state.test_count as usize {
        errors.push(format!(
            "{passing} passing tests recorded but test_count is {}",
            state.test_count
        ));
    }
    if let Some(cycle) = &state.cycle {
        match cycle.phase {
            Phase::Red => {
                if cycle.test.is_some() {
                    errors.push("red cycle must not carry a committed test".to_string());
                }
                if cycle.pre_test_count != state.test_count {
                    errors.push(format!(
                        "red cycle pre_test_count {} differs from test_count {}",
                        cycle.pre_test_count, state.test_count
                    ));
                }
            }
            Phase::Green => {
                if cycle.test.is_none() {
                    errors.push("green cycle is missing its test".to_string());
                }
                if cycle.red_mark.is_none() {
                    errors.push("green cycle is missing its red mark".to_string());
                }
                if state.test_count != cycle.pre_test_count + 1 {
                    errors.push(format!(
                        "green cycle test_count {} is not pre_test_count {} + 1",
                        state.test_count, cycle.pre_test_count
                    ));
                }
            }
        }
        if !cycle.coverage.is_subset(&cycle.added_lines) {
            errors.push("coverage lists lines that were not added".to_string());
        }
    }
    errors
}

/// A committed Red phase: one more test, same cycle index, now in Green.
pub fn validate_red_commit(prev: &StateEnvelope, next: &StateEnvelope) -> Vec<String> {
    let mut errors = Vec::new();
    if next.test_count != prev.test_count + 1 {
        errors.push(format!(
            "red commit must add exactly one test ({} -> {})",
            prev.test_count, next.test_count
        ));
    }
    if next.cycle_index != prev.cycle_index {
        errors.push("red commit must not advance the cycle index".to_string());
    }
    match &next.cycle {
        Some(cycle) if cycle.phase == Phase::Green => {
            if cycle.test.is_none() {
                errors.push("red commit must carry the new test".to_string());
            }
            if cycle.failure_output.is_none() {
                errors.push("red commit must capture the failure output".to_string());
            }
        }
        _ => errors.push("red commit must leave the cycle in green".to_string()),
    }
    errors
}

/// A committed Green phase: cycle closed, index advanced, no regressions.
pub fn validate_green_commit(prev: &StateEnvelope, next: &StateEnvelope) -> Vec<String> {
    let mut errors = Vec::new();
    if next.cycle.is_some() {
        errors.push("green commit must clear the cycle record".to_string());
    }
    if next.test_count != prev.test_count {
        errors.push(format!(
            "green commit must not change the test count ({} -> {})",
            prev.test_count, next.test_count
        ));
    }
    if next.cycle_index != prev.cycle_index + 1 {
        errors.push(format!(
            "green commit must advance the cycle index by one ({} -> {})",
            prev.cycle_index, next.cycle_index
        ));
    }
    if let Some(cycle) = &prev.cycle {
        let lost: Vec<&str> = cycle
            .pre_passing
            .iter()
            .filter(|name| !next.passing.contains(*name))
            .map(String::as_str)
            .collect();
        if !lost.is_empty() {
            errors.push(format!("green commit regressed: {}", lost.join(", ")));
        }
        if let Some(test) = &cycle.test {
            if !next.passing.contains(&test.id) {
                errors.push(format!("green commit must pass {}", test.id));
            }
        }
    }
    errors
}

/// A rejected attempt looping back into the same phase: counters unchanged,
/// attempts incremented.
pub fn validate_retry(prev: &StateEnvelope, next: &StateEnvelope) -> Vec<String> {
    let mut errors = Vec::new();
    if next.test_count != prev.test_count {
        errors.push("retry must not change the test count".to_string());
    }
    if next.cycle_index != prev.cycle_index {
        errors.push("retry must not change the cycle index".to_string());
    }
    match (&prev.cycle, &next.cycle) {
        (Some(before), Some(after)) => {
            if before.phase != after.phase {
                errors.push("retry must stay in the same phase".to_string());
            }
            if after.attempts != before.attempts + 1 {
                errors.push(format!(
                    "retry must increment attempts ({} -> {})",
                    before.attempts, after.attempts
                ));
            }
        }
        _ => errors.push("retry requires an open cycle".to_string()),
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CycleRecord, Requirement, TestCaseSource, WorkspaceMark};

    fn requirement() -> Requirement {
        Requirement {
            id: "add".to_string(),
            text: "add(2,3) returns 5".to_string(),
        }
    }

    fn red_state() -> StateEnvelope {
        StateEnvelope {
            cycle: Some(CycleRecord::open(requirement(), 0, Default::default())),
            ..StateEnvelope::default()
        }
    }

    fn green_state() -> StateEnvelope {
        let mut cycle = CycleRecord::open(requirement(), 0, Default::default());
        cycle.phase = Phase::Green;
        cycle.test = Some(TestCaseSource {
            id: "adds".to_string(),
            path: "tests/adds.rs".to_string(),
            source: "assert add".to_string(),
        });
        cycle.failure_output = Some("add is undefined".to_string());
        cycle.red_mark = Some(WorkspaceMark("abc".to_string()));
        StateEnvelope {
            test_count: 1,
            cycle: Some(cycle),
            ..StateEnvelope::default()
        }
    }

    #[test]
    fn red_to_green_with_one_new_test_is_valid() {
        let errors = validate_red_commit(&red_state(), &green_state());
        assert!(errors.is_empty(), "{errors:?}");
        assert!(validate_envelope(&green_state()).is_empty());
    }

    /// A Red commit that does not carry a +1 test delta is rejected.
    #[test]
    fn red_commit_without_plus_one_is_rejected() {
        let mut next = green_state();
        next.test_count = 2;
        let errors = validate_red_commit(&red_state(), &next);
        assert!(errors.iter().any(|e| e.contains("exactly one test")));
    }

    #[test]
    fn green_commit_must_close_cycle_and_keep_passing_set() {
        let prev = green_state();
        let mut next = prev.clone();
        next.cycle = None;
        next.cycle_index = 1;
        next.passing.insert("adds".to_string());
        assert!(validate_green_commit(&prev, &next).is_empty());

        let mut regressed = prev.clone();
        if let Some(cycle) = regressed.cycle.as_mut() {
            cycle.pre_passing.insert("old".to_string());
        }
        let errors = validate_green_commit(&regressed, &next);
        assert!(errors.iter().any(|e| e.contains("regressed: old")));
    }

    #[test]
    fn retry_must_increment_attempts_only() {
        let prev = red_state();
        let mut next = prev.clone();
        if let Some(cycle) = next.cycle.as_mut() {
            cycle.attempts = 1;
            cycle.feedback = Some("reviewer rejected".to_string());
        }
        assert!(validate_retry(&prev, &next).is_empty());

        next.test_count = 1;
        assert!(!validate_retry(&prev, &next).is_empty());
    }

    #[test]
    fn envelope_rejects_more_passing_than_tests() {
        let mut state = StateEnvelope::default();
        state.passing.insert("ghost".to_string());
        let errors = validate_envelope(&state);
        assert_eq!(errors.len(), 1);
    }
}
