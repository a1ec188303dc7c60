//! Shared deterministic types for the executor and the ratchet cycle.
//!
//! These types are the durable contract between nodes: everything here is
//! serialized into checkpoints, so field changes must stay backwards
//! compatible (`#[serde(default)]`, unknown fields preserved in `extra`).

use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::ids::NodeRef;
use crate::error::{ErrorInfo, ErrorKind};

/// Current envelope schema version written by this build.
pub const ENVELOPE_SCHEMA_VERSION: u32 = 1;

/// One unit of behaviour to be ratcheted in with a single test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub text: String,
}

/// The single test produced by the tester role for a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseSource {
    /// Identifier the test runner reports for this test.
    pub id: String,
    /// Workspace-relative path of the file holding the test.
    pub path: String,
    /// Full file contents.
    pub source: String,
}

/// A workspace-relative source location.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceLine {
    pub path: String,
    pub line: u32,
}

impl SourceLine {
    pub fn new(path: impl Into<String>, line: u32) -> Self {
        Self {
            path: path.into(),
            line,
        }
    }
}

impl fmt::Display for SourceLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.line)
    }
}

/// Opaque handle naming a committed workspace state (a commit id for git).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceMark(pub String);

impl WorkspaceMark {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Half of a ratchet cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Red,
    Green,
}

/// In-flight bookkeeping for the cycle currently being ratcheted.
///
/// Exists only between `select` and a committed Green; cleared on commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub phase: Phase,
    pub requirement: Requirement,
    /// Set once Red commits.
    #[serde(default)]
    pub test: Option<TestCaseSource>,
    pub pre_test_count: u32,
    /// Tests passing before the cycle opened.
    #[serde(default)]
    pub pre_passing: BTreeSet<String>,
    /// Runner output captured when the new test failed in Red.
    #[serde(default)]
    pub failure_output: Option<String>,
    /// Workspace state with the new test committed.
    #[serde(default)]
    pub red_mark: Option<WorkspaceMark>,
    /// Lines added by the last Green attempt.
    #[serde(default)]
    pub added_lines: BTreeSet<SourceLine>,
    /// Subset of `added_lines` executed by the cycle's test.
    #[serde(default)]
    pub coverage: BTreeSet<SourceLine>,
    /// Rejected attempts within the current phase.
    #[serde(default)]
    pub attempts: u32,
    /// Reason the previous attempt was rejected, handed to the next attempt.
    #[serde(default)]
    pub feedback: Option<String>,
}

impl CycleRecord {
    pub fn open(requirement: Requirement, pre_test_count: u32, pre_passing: BTreeSet<String>) -> Self {
        Self {
            phase: Phase::Red,
            requirement,
            test: None,
            pre_test_count,
            pre_passing,
            failure_output: None,
            red_mark: None,
            added_lines: BTreeSet::new(),
            coverage: BTreeSet::new(),
            attempts: 0,
            feedback: None,
        }
    }
}

/// One committed phase, appended to the envelope history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub node: NodeRef,
    pub cycle: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    /// Rejected attempts before this phase committed.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark: Option<WorkspaceMark>,
    #[serde(default)]
    pub summary: String,
}

/// Pipeline state handed from node to node by value.
///
/// A node never mutates the envelope it was given in place; it consumes it and
/// returns the successor in its `Transition`. Unknown fields written by newer
/// builds are kept in `extra` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEnvelope {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub specification: String,
    #[serde(default)]
    pub public_signatures: Vec<String>,
    #[serde(default)]
    pub fixtures: Vec<String>,
    /// Requirements not yet ratcheted, in order.
    #[serde(default)]
    pub pending: VecDeque<Requirement>,
    #[serde(default)]
    pub test_count: u32,
    #[serde(default)]
    pub cycle_index: u32,
    /// Last committed workspace state.
    #[serde(default)]
    pub baseline: Option<WorkspaceMark>,
    /// Tests passing at the last commit.
    #[serde(default)]
    pub passing: BTreeSet<String>,
    #[serde(default)]
    pub cycle: Option<CycleRecord>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_schema_version() -> u32 {
    ENVELOPE_SCHEMA_VERSION
}

impl Default for StateEnvelope {
    fn default() -> Self {
        Self {
            schema_version: ENVELOPE_SCHEMA_VERSION,
            specification: String::new(),
            public_signatures: Vec::new(),
            fixtures: Vec::new(),
            pending: VecDeque::new(),
            test_count: 0,
            cycle_index: 0,
            baseline: None,
            passing: BTreeSet::new(),
            cycle: None,
            history: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl StateEnvelope {
    pub fn new(specification: impl Into<String>, requirements: Vec<Requirement>) -> Self {
        Self {
            specification: specification.into(),
            pending: requirements.into(),
            ..Self::default()
        }
    }

    /// Requirement id of the open cycle, if any.
    pub fn open_requirement(&self) -> Option<&str> {
        self.cycle.as_ref().map(|c| c.requirement.id.as_str())
    }
}

/// Result of one node invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Commit `state` and continue at `next`.
    Advance { next: NodeRef, state: StateEnvelope },
    /// Terminal success.
    Done { result: Value },
    /// Node-level failure; the last checkpoint is left in place.
    Failed { error: ErrorInfo },
}

impl Transition {
    pub fn advance(next: &NodeRef, state: StateEnvelope) -> Self {
        Self::Advance {
            next: next.clone(),
            state,
        }
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failed {
            error: ErrorInfo::new(kind, message),
        }
    }
}

/// Final payload returned by the verify node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub cycles: u32,
    pub test_count: u32,
    pub passing: BTreeSet<String>,
    pub history: Vec<HistoryEntry>,
}

/// Outcome of one full test-suite run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub passed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub total: u32,
    /// Raw runner output, used as failure text and rejection feedback.
    #[serde(default)]
    pub output: String,
}

impl TestRunResult {
    pub fn from_sets(passed: BTreeSet<String>, failed: BTreeSet<String>, output: String) -> Self {
        let total = u32::try_from(passed.len() + failed.len()).unwrap_or(u32::MAX);
        Self {
            passed,
            failed,
            total,
            output,
        }
    }
}

/// Lines a single test executed, restricted to the lines asked about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageResult {
    pub executed_lines: BTreeSet<SourceLine>,
}

/// Result of compiling or parsing the test set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "output", rename_all = "snake_case")]
pub enum CompileVerdict {
    Ok,
    Error(String),
}

/// A whole-file change applied to the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    /// Workspace-relative path.
    pub path: String,
    /// New contents; `None` deletes the file.
    pub contents: Option<String>,
}

impl FileEdit {
    pub fn write(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: Some(contents.into()),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fields written by a newer build survive a decode/encode pass untouched.
    #[test]
    fn envelope_preserves_unknown_fields() {
        let raw = r#"{
            "schema_version": 1,
            "specification": "adder",
            "test_count": 2,
            "reviewer_notes": {"strict": true},
            "future_counter": 9
        }"#;
        let state: StateEnvelope = serde_json::from_str(raw).expect("parse");
        assert_eq!(state.test_count, 2);
        assert_eq!(state.extra.get("future_counter"), Some(&Value::from(9)));

        let encoded = serde_json::to_value(&state).expect("encode");
        assert_eq!(encoded["reviewer_notes"]["strict"], Value::Bool(true));
        assert_eq!(encoded["future_counter"], Value::from(9));
    }

    #[test]
    fn envelope_defaults_missing_fields() {
        let state: StateEnvelope = serde_json::from_str("{}").expect("parse");
        assert_eq!(state, StateEnvelope::default());
    }

    #[test]
    fn source_line_orders_by_path_then_line() {
        let mut lines = vec![
            SourceLine::new("src/b.rs", 1),
            SourceLine::new("src/a.rs", 9),
            SourceLine::new("src/a.rs", 2),
        ];
        lines.sort();
        let rendered: Vec<String> = lines.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["src/a.rs:2", "src/a.rs:9", "src/b.rs:1"]);
    }
}
