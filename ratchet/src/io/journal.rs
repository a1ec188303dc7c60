//! Step journal for `.ratchet/runs/<run-id>/steps/`.
//!
//! One JSON record per executed transition, written after the checkpoint
//! commit. The journal is for people inspecting a run; the executor never
//! reads it back, and a failed journal write never affects the checkpoint.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::ids::{NodeRef, RunId};
use crate::error::ErrorInfo;

/// One executed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub run_id: RunId,
    /// Checkpoint sequence after the step; unchanged for terminal steps.
    pub seq: u64,
    pub node: NodeRef,
    /// `advance`, `done` or `failed`.
    pub transition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NodeRef>,
    pub test_count: u32,
    pub cycle_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct StepJournal {
    runs_dir: PathBuf,
}

impl StepJournal {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn steps_dir(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir.join(run_id.as_str()).join("steps")
    }

    /// Write `entry` and return its path.
    ///
    /// Advances are keyed by sequence number; terminal steps go to `final.json`.
    pub fn record(&self, entry: &JournalEntry) -> Result<PathBuf> {
        let dir = self.steps_dir(&entry.run_id);
        fs::create_dir_all(&dir).with_context(|| format!("create journal dir {}", dir.display()))?;
        let name = match entry.next {
            Some(_) => format!("{:06}.json", entry.seq),
            None => "final.json".to_string(),
        };
        let path = dir.join(name);
        write_json(&path, entry)?;
        Ok(path)
    }

    /// All recorded entries for `run_id`, in execution order.
    pub fn entries(&self, run_id: &RunId) -> Result<Vec<JournalEntry>> {
        let dir = self.steps_dir(run_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("read journal dir {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        // zero-padded sequence names sort before "final.json"
        paths.sort();
        paths
            .iter()
            .map(|path| read_json(path))
            .collect()
    }
}

fn write_json(path: &Path, entry: &JournalEntry) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(entry).context("serialize journal entry")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write journal entry {}", path.display()))
}

fn read_json(path: &Path) -> Result<JournalEntry> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read journal entry {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u64, next: Option<&str>) -> JournalEntry {
        JournalEntry {
            run_id: RunId::new("run-1").expect("run"),
            seq,
            node: NodeRef::new("red").expect("node"),
            transition: if next.is_some() { "advance" } else { "done" }.to_string(),
            next: next.map(|n| NodeRef::new(n).expect("node")),
            test_count: 1,
            cycle_index: 0,
            requirement: Some("add".to_string()),
            error: None,
            duration_ms: 12,
        }
    }

    #[test]
    fn entries_come_back_in_step_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let journal = StepJournal::new(temp.path());
        journal.record(&entry(10, Some("green"))).expect("10");
        journal.record(&entry(2, Some("red"))).expect("2");
        journal.record(&entry(10, None)).expect("final");

        let entries = journal
            .entries(&RunId::new("run-1").expect("run"))
            .expect("entries");
        let seqs: Vec<(u64, String)> = entries
            .iter()
            .map(|e| (e.seq, e.transition.clone()))
            .collect();
        assert_eq!(
            seqs,
            vec![
                (2, "advance".to_string()),
                (10, "advance".to_string()),
                (10, "done".to_string())
            ]
        );
    }

    #[test]
    fn missing_run_has_no_entries() {
        let temp = tempfile::tempdir().expect("tempdir");
        let journal = StepJournal::new(temp.path());
        let entries = journal
            .entries(&RunId::new("nobody").expect("run"))
            .expect("entries");
        assert!(entries.is_empty());
    }
}
