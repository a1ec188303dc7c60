//! Structured error taxonomy shared by the executor, the checkpoint store and
//! the ratchet nodes.
//!
//! `anyhow` carries context through I/O plumbing; the types here are what a
//! run ultimately reports. An `anyhow::Error` escaping a node is classified by
//! [`classify`]: an [`ErrorInfo`] found by downcast keeps its kind, anything
//! else is a capability failure.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ids::{NodeRef, RunId};

/// Category of a terminal run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An inventory-lock, coverage-lock or write-scope check failed after the
    /// owning phase exhausted its attempt budget.
    RatchetViolation,
    /// An external provider errored, panicked or timed out.
    CapabilityFailure,
    /// The checkpoint could not be made durable.
    IoFailure,
    /// A recovered checkpoint could not be decoded or resolved.
    CorruptData,
    /// The abort signal was raised between node invocations.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RatchetViolation => "ratchet_violation",
            Self::CapabilityFailure => "capability_failure",
            Self::IoFailure => "io_failure",
            Self::CorruptData => "corrupt_data",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable failure payload carried by `Transition::Failed` and
/// `RunOutcome::Aborted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    /// Node that was executing when the failure surfaced, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeRef>,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            node: None,
            message: message.into(),
        }
    }

    pub fn violation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RatchetViolation, message)
    }

    pub fn capability(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CapabilityFailure, message)
    }

    /// Attach the executing node unless one is already recorded.
    pub fn at(mut self, node: &NodeRef) -> Self {
        if self.node.is_none() {
            self.node = Some(node.clone());
        }
        self
    }
}

/// Map an error escaping a node body onto the taxonomy.
pub fn classify(node: &NodeRef, err: anyhow::Error) -> ErrorInfo {
    match err.downcast::<ErrorInfo>() {
        Ok(info) => info.at(node),
        Err(other) => ErrorInfo::capability(format!("{other:#}")).at(node),
    }
}

/// Failures of the durable checkpoint store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no checkpoint for run {0}")]
    NotFound(RunId),

    #[error("checkpoint {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("stale writer for run {run_id}: expected seq {expected}, found {found}")]
    StaleSequence {
        run_id: RunId,
        expected: u64,
        found: u64,
    },

    #[error("{action} {}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encode checkpoint for run {run_id}")]
    Encode {
        run_id: RunId,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

/// Failures that prevent a run from starting or resuming at all.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no checkpoint for run {0}")]
    NotFound(RunId),

    #[error("checkpoint for run {run_id} cannot be resumed: {reason}")]
    CorruptData { run_id: RunId, reason: String },

    #[error("node {0} is not registered")]
    UnknownNode(NodeRef),

    #[error(transparent)]
    Store(StoreError),
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CorruptData { .. } => ErrorKind::CorruptData,
            Self::UnknownNode(_) => ErrorKind::CorruptData,
            Self::NotFound(_) | Self::Store(_) => ErrorKind::IoFailure,
        }
    }
}

impl From<StoreError> for RunError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(run_id) => Self::NotFound(run_id),
            StoreError::Corrupt { path, reason } => Self::CorruptData {
                run_id: run_id_from_path(&path),
                reason,
            },
            other => Self::Store(other),
        }
    }
}

fn run_id_from_path(path: &std::path::Path) -> RunId {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| RunId::new(stem).ok())
        .unwrap_or_else(RunId::unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn classify_keeps_structured_kind() {
        let node = NodeRef::new("red").expect("node");
        let err = anyhow::Error::new(ErrorInfo::violation("count mismatch"));
        let info = classify(&node, err);
        assert_eq!(info.kind, ErrorKind::RatchetViolation);
        assert_eq!(info.node, Some(node));
    }

    #[test]
    fn classify_defaults_to_capability_failure() {
        let node = NodeRef::new("green").expect("node");
        let info = classify(&node, anyhow!("spawn agent").context("implementer"));
        assert_eq!(info.kind, ErrorKind::CapabilityFailure);
        assert!(info.message.contains("implementer"));
        assert!(info.message.contains("spawn agent"));
    }

    #[test]
    fn corrupt_store_error_maps_to_corrupt_run_error() {
        let err = StoreError::Corrupt {
            path: PathBuf::from("/tmp/.ratchet/checkpoints/run-7.json"),
            reason: "expected value".to_string(),
        };
        match RunError::from(err) {
            RunError::CorruptData { run_id, reason } => {
                assert_eq!(run_id.as_str(), "run-7");
                assert_eq!(reason, "expected value");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::RatchetViolation).expect("json");
        assert_eq!(json, "\"ratchet_violation\"");
    }
}
