//! The capability namespace injected into every node invocation.
//!
//! Each role gets its own narrow brief type. The implementer's brief has no
//! field that could carry test source, and the tester's brief has no field
//! that could carry implementation.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::types::{
    CompileVerdict, CoverageResult, FileEdit, Requirement, SourceLine, TestCaseSource,
    TestRunResult, WorkspaceMark,
};

/// Everything the tester is allowed to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TesterBrief {
    pub requirement: Requirement,
    pub public_signatures: Vec<String>,
    pub fixtures: Vec<String>,
    /// Directory the new test must be written under.
    pub tests_dir: String,
    /// Why the previous attempt in this cycle was rejected.
    pub feedback: Option<String>,
}

/// Everything the reviewer is allowed to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewBrief {
    pub requirement: Requirement,
    pub test: TestCaseSource,
}

/// Everything the implementer is allowed to see: the failing assertion output
/// and nothing from the test itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImplementerBrief {
    pub failure_message: String,
    /// Why the previous attempt in this cycle was rejected.
    pub feedback: Option<String>,
}

/// Reviewer decision on whether a test matches its requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum MatchVerdict {
    Accept,
    Reject { reason: String },
}

/// The implementer's proposed change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceModification {
    pub edits: Vec<FileEdit>,
    #[serde(default)]
    pub summary: String,
}

pub trait Tester: Send + Sync {
    /// Produce exactly one new test for the requirement.
    fn write_test(&self, brief: &TesterBrief) -> Result<TestCaseSource>;
}

pub trait Reviewer: Send + Sync {
    fn review(&self, brief: &ReviewBrief) -> Result<MatchVerdict>;
}

pub trait Implementer: Send + Sync {
    fn implement(&self, brief: &ImplementerBrief) -> Result<SourceModification>;
}

pub trait TestRunner: Send + Sync {
    /// Run the whole suite against the current workspace.
    fn run_tests(&self) -> Result<TestRunResult>;
}

pub trait CoverageMeter: Send + Sync {
    /// Which of `added` lines does `test_id` execute on its own?
    fn measure(&self, added: &BTreeSet<SourceLine>, test_id: &str) -> Result<CoverageResult>;
}

pub trait CompileChecker: Send + Sync {
    /// Compile or parse the test set with `source` in place.
    fn check(&self, source: &TestCaseSource) -> Result<CompileVerdict>;
}

/// The working tree the roles write into.
///
/// Marks name committed states; every node rewinds to the last committed mark
/// before doing work, which makes a re-invocation after a crash start from the
/// same files as the first invocation did.
pub trait Workspace: Send + Sync {
    /// Record the current files as a committed state.
    fn mark(&self, label: &str) -> Result<WorkspaceMark>;
    /// Discard everything since `mark`.
    fn rewind(&self, mark: &WorkspaceMark) -> Result<()>;
    fn apply(&self, edits: &[FileEdit]) -> Result<()>;
    /// Lines present now that were not present at `since`.
    fn added_lines(&self, since: &WorkspaceMark) -> Result<BTreeSet<SourceLine>>;
}

/// Resolved table of providers, shared by every node of a run.
#[derive(Clone)]
pub struct Capabilities {
    pub tester: Arc<dyn Tester>,
    pub reviewer: Arc<dyn Reviewer>,
    pub implementer: Arc<dyn Implementer>,
    pub tests: Arc<dyn TestRunner>,
    pub coverage: Arc<dyn CoverageMeter>,
    pub compiler: Arc<dyn CompileChecker>,
    pub workspace: Arc<dyn Workspace>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_uses_tagged_json() {
        let accept: MatchVerdict = serde_json::from_str(r#"{"verdict":"accept"}"#).expect("parse");
        assert_eq!(accept, MatchVerdict::Accept);
        let reject: MatchVerdict =
            serde_json::from_str(r#"{"verdict":"reject","reason":"asserts logging"}"#)
                .expect("parse");
        assert_eq!(
            reject,
            MatchVerdict::Reject {
                reason: "asserts logging".to_string()
            }
        );
    }

    /// The implementer brief serializes without any test-bearing field.
    #[test]
    fn implementer_brief_carries_no_test_source() {
        let brief = ImplementerBrief {
            failure_message: "assertion failed: add(2, 3) == 5".to_string(),
            feedback: None,
        };
        let value = serde_json::to_value(&brief).expect("json");
        let keys: Vec<&String> = value.as_object().expect("object").keys().collect();
        assert_eq!(keys, vec!["failure_message", "feedback"]);
    }
}
