//! CLI orchestration: wire config-driven capabilities into an executor and
//! drive, inspect or clear one run.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::info;

use crate::capability::Capabilities;
use crate::core::ids::{NodeRef, RunId};
use crate::core::types::Phase;
use crate::cycle::{build_registry, start_node};
use crate::error::StoreError;
use crate::graph::{AbortSignal, ExecutorOptions, GraphExecutor, RunOutcome, StepReport};
use crate::io::agents::{AgentImplementer, AgentReviewer, AgentRole, AgentTester, CommandAgent};
use crate::io::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::io::compile::CommandCompileChecker;
use crate::io::config::{RatchetConfig, load_config};
use crate::io::coverage::LcovCoverageMeter;
use crate::io::git::GitWorkspace;
use crate::io::journal::StepJournal;
use crate::io::paths::RatchetPaths;
use crate::io::plan::load_plan;
use crate::io::prompt::PromptEngine;
use crate::io::test_runner::CommandTestRunner;
use crate::io::view::{Visibility, WorkspaceView};

/// A workspace root with its loaded config.
#[derive(Debug, Clone)]
pub struct Session {
    paths: RatchetPaths,
    config: RatchetConfig,
}

impl Session {
    /// Open the workspace at `root`. A missing `.ratchet/config.toml` means
    /// defaults.
    pub fn open(root: &Path) -> Result<Self> {
        let root = fs::canonicalize(root).with_context(|| format!("resolve {}", root.display()))?;
        let paths = RatchetPaths::new(root);
        let config = load_config(&paths.config_path)?;
        Ok(Self { paths, config })
    }

    /// Runs only start in a root prepared by `ratchet init`, so checkpoints
    /// sit in a git-ignored `.ratchet/`.
    pub fn require_initialized(&self) -> Result<()> {
        if !self.paths.config_path.is_file() {
            bail!(
                "{} is not a ratchet workspace (no {}); run `ratchet init` first",
                self.paths.root.display(),
                self.paths.config_path.display()
            );
        }
        Ok(())
    }

    pub fn paths(&self) -> &RatchetPaths {
        &self.paths
    }

    pub fn config(&self) -> &RatchetConfig {
        &self.config
    }

    pub fn store(&self) -> FileCheckpointStore {
        FileCheckpointStore::new(&self.paths.checkpoints_dir)
    }

    /// Command-backed providers for `run_id`. Agent scratch files land in
    /// `.ratchet/runs/<run-id>/agents/<role>/`; each agent process runs in
    /// `.ratchet/runs/<run-id>/views/<role>/`, a copy of the workspace holding
    /// only what the role may read.
    pub fn capabilities(&self, run_id: &RunId) -> Result<Capabilities> {
        let root = &self.paths.root;
        let cfg = &self.config;
        let timeout = cfg.command_timeout();
        let limit = cfg.output_limit_bytes;
        let tests_dir = cfg.cycle_settings().tests_dir;
        let prompts = Arc::new(PromptEngine::new(cfg.prompt_budget_bytes)?);
        let run_dir = self.paths.run_dir(run_id);
        let role = |name: &'static str, command: &[String], visibility: Visibility| {
            let view = WorkspaceView::new(root, run_dir.join("views").join(name), &tests_dir, visibility);
            AgentRole::new(
                name,
                Arc::new(CommandAgent::new(command.to_vec(), root, timeout, limit).with_view(view)),
                Arc::clone(&prompts),
                run_dir.join("agents").join(name),
            )
        };

        Ok(Capabilities {
            tester: Arc::new(AgentTester {
                role: role("tester", &cfg.agents.tester, Visibility::TestsOnly),
            }),
            reviewer: Arc::new(AgentReviewer {
                role: role("reviewer", &cfg.agents.reviewer, Visibility::TestsOnly),
            }),
            implementer: Arc::new(AgentImplementer {
                role: role("implementer", &cfg.agents.implementer, Visibility::ExceptTests),
                tests_dir: tests_dir.clone(),
            }),
            tests: Arc::new(CommandTestRunner::new(root, &cfg.tests, timeout, limit)?),
            coverage: Arc::new(LcovCoverageMeter::new(
                root,
                cfg.coverage.clone(),
                cfg.coverage_granularity,
                timeout,
                limit,
            )),
            compiler: Arc::new(CommandCompileChecker::new(
                root,
                cfg.compile.command.clone(),
                timeout,
                limit,
            )),
            workspace: Arc::new(GitWorkspace::new(root)),
        })
    }

    pub fn executor(&self, caps: Capabilities, abort: AbortSignal) -> GraphExecutor {
        GraphExecutor::new(
            build_registry(&self.config.cycle_settings()),
            Arc::new(self.store()),
            caps,
            ExecutorOptions {
                node_timeout: self.config.node_timeout(),
                abort,
                journal: Some(StepJournal::new(&self.paths.runs_dir)),
            },
        )
    }
}

/// `ratchet start`: begin `run_id` from a plan, or resume it if a checkpoint
/// already exists.
pub fn start<F: FnMut(&StepReport)>(
    root: &Path,
    run_id: &RunId,
    plan_path: &Path,
    on_step: F,
) -> Result<RunOutcome> {
    let session = Session::open(root)?;
    session.require_initialized()?;
    let plan = load_plan(plan_path)?;
    info!(run_id = %run_id, requirements = plan.requirements.len(), "loaded plan");
    let executor = session.executor(session.capabilities(run_id)?, AbortSignal::new());
    let handle = executor
        .start_run(run_id, &start_node(), plan.into_envelope())
        .with_context(|| format!("start run {run_id}"))?;
    Ok(handle.run(on_step))
}

/// `ratchet resume`: continue `run_id` from its last committed checkpoint.
pub fn resume<F: FnMut(&StepReport)>(root: &Path, run_id: &RunId, on_step: F) -> Result<RunOutcome> {
    let session = Session::open(root)?;
    session.require_initialized()?;
    let executor = session.executor(session.capabilities(run_id)?, AbortSignal::new());
    let handle = executor
        .resume_run(run_id)
        .with_context(|| format!("resume run {run_id}"))?;
    Ok(handle.run(on_step))
}

/// Snapshot of a parked run, as printed by `ratchet status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub seq: u64,
    pub node: NodeRef,
    pub test_count: u32,
    pub cycle_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    pub attempts: u32,
    pub pending: Vec<String>,
    pub saved_at_unix_ms: u64,
    pub checkpoint: PathBuf,
}

/// `ratchet status`: read the checkpoint without running anything.
pub fn status(root: &Path, run_id: &RunId) -> Result<RunStatus> {
    let session = Session::open(root)?;
    let store = session.store();
    let checkpoint = store
        .load(run_id)
        .with_context(|| format!("status of run {run_id}"))?;
    let state = &checkpoint.state;
    Ok(RunStatus {
        run_id: checkpoint.run_id.clone(),
        seq: checkpoint.seq,
        node: checkpoint.node.clone(),
        test_count: state.test_count,
        cycle_index: state.cycle_index,
        requirement: state.open_requirement().map(str::to_string),
        phase: state.cycle.as_ref().map(|c| c.phase),
        attempts: state.cycle.as_ref().map_or(0, |c| c.attempts),
        pending: state.pending.iter().map(|r| r.id.clone()).collect(),
        saved_at_unix_ms: checkpoint.saved_at_unix_ms,
        checkpoint: store.path_for(run_id),
    })
}

/// `ratchet clear`: drop the checkpoint of `run_id`. Returns whether one
/// existed.
pub fn clear(root: &Path, run_id: &RunId) -> Result<bool> {
    let session = Session::open(root)?;
    let store = session.store();
    let existed = match store.load(run_id) {
        Ok(_) => true,
        Err(StoreError::NotFound(_)) => false,
        Err(StoreError::Corrupt { .. }) => true,
        Err(err) => return Err(err).with_context(|| format!("clear run {run_id}")),
    };
    store
        .clear(run_id)
        .with_context(|| format!("clear run {run_id}"))?;
    if existed {
        info!(run_id = %run_id, "checkpoint cleared");
    }
    Ok(existed)
}
