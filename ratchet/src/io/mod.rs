//! Side-effecting adapters: persistence, configuration, child processes and
//! the concrete capability providers.

pub mod agents;
pub mod checkpoint;
pub mod compile;
pub mod config;
pub mod coverage;
pub mod git;
pub mod journal;
pub mod paths;
pub mod plan;
pub mod process;
pub mod prompt;
pub mod schema;
pub mod test_runner;
pub mod view;
