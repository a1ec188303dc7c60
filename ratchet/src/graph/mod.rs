//! Resumable state-machine executor over named nodes.

pub mod abort;
pub mod executor;
pub mod node;

pub use abort::AbortSignal;
pub use executor::{ExecutorOptions, GraphExecutor, RunHandle, RunOutcome, StepEvent, StepReport};
pub use node::{Node, NodeRegistry};
