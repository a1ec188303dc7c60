//! Stable exit codes for ratchet CLI commands.

use crate::error::{RunError, StoreError};
use crate::graph::RunOutcome;

/// The run terminated, or the command succeeded.
pub const OK: i32 = 0;
/// Invalid usage, config, plan, or an I/O error outside a run.
pub const INVALID: i32 = 1;
/// The run stopped with a structured error; its checkpoint is kept.
pub const ABORTED: i32 = 2;
/// No checkpoint exists for the run.
pub const NOT_FOUND: i32 = 3;
/// The checkpoint exists but cannot be resumed.
pub const CORRUPT: i32 = 4;

pub fn for_outcome(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Terminated { .. } => OK,
        RunOutcome::Aborted { .. } => ABORTED,
    }
}

/// Exit code for an error that escaped a command, looking through anyhow
/// context for the typed run and store errors.
pub fn for_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(run) = cause.downcast_ref::<RunError>() {
            return match run {
                RunError::NotFound(_) => NOT_FOUND,
                RunError::CorruptData { .. } => CORRUPT,
                RunError::UnknownNode(_) | RunError::Store(_) => INVALID,
            };
        }
        if let Some(store) = cause.downcast_ref::<StoreError>() {
            return match store {
                StoreError::NotFound(_) => NOT_FOUND,
                StoreError::Corrupt { .. } => CORRUPT,
                _ => INVALID,
            };
        }
    }
    INVALID
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::RunId;
    use anyhow::Context;

    #[test]
    fn typed_errors_map_through_context() {
        let run_id = RunId::new("r1").expect("id");
        let err: anyhow::Result<()> = Err(RunError::NotFound(run_id.clone())).context("resume r1");
        assert_eq!(for_error(&err.unwrap_err()), NOT_FOUND);

        let err = anyhow::Error::new(RunError::CorruptData {
            run_id,
            reason: "bad json".to_string(),
        });
        assert_eq!(for_error(&err), CORRUPT);
        assert_eq!(for_error(&anyhow::anyhow!("bad plan")), INVALID);
    }
}
