//! Resumable, checkpointed graph execution and the Red/Green TDD cycle
//! built on it.
//!
//! The crate keeps a strict split between deciding and doing:
//!
//! - **[`core`]**: Pure, deterministic logic (ids, envelopes, ratchet gates,
//!   write scopes, attempt budgets). No I/O.
//! - **[`graph`]**: The executor. Invokes one node at a time and commits
//!   each advance to a checkpoint store before the next node runs.
//! - **[`cycle`]**: The ratchet nodes (baseline, select, red, green, verify),
//!   written against the [`capability`] traits only.
//! - **[`io`]**: Side-effecting providers (checkpoint files, git, agent and
//!   test commands, coverage reports, config).
//!
//! [`session`] wires config-driven providers into an executor for the CLI.

pub mod capability;
pub mod core;
pub mod cycle;
pub mod error;
pub mod exit_codes;
pub mod graph;
pub mod io;
pub mod logging;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
