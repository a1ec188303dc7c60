//! Agent-backed role providers.
//!
//! The [`AgentExecutor`] trait decouples the roles from the agent backend.
//! [`CommandAgent`] spawns a configured command with the prompt on stdin and
//! expects a JSON answer in the file named by `{output}`; tests use scripted
//! executors that write the answer directly.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::capability::{
    Implementer, ImplementerBrief, MatchVerdict, ReviewBrief, Reviewer, SourceModification, Tester,
    TesterBrief,
};
use crate::core::types::TestCaseSource;
use crate::io::process::{CommandOutput, command_from_argv, run_command};
use crate::io::prompt::PromptEngine;
use crate::io::schema::{MODIFICATION_SCHEMA, TEST_CASE_SCHEMA, VERDICT_SCHEMA, validate_against};
use crate::io::view::WorkspaceView;

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub role: &'static str,
    pub prompt: String,
    /// Where the agent must write its JSON answer.
    pub output_path: PathBuf,
    /// Where the agent's stdout/stderr is kept for inspection.
    pub log_path: PathBuf,
}

pub trait AgentExecutor: Send + Sync {
    /// Run the agent. On success the answer is at `request.output_path`.
    fn exec(&self, request: &AgentRequest) -> Result<()>;
}

/// Executor spawning a configured command, in `workdir` or in a freshly
/// built [`WorkspaceView`] when one is set.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: Vec<String>,
    workdir: PathBuf,
    view: Option<WorkspaceView>,
    timeout: Duration,
    output_limit: usize,
}

impl CommandAgent {
    pub fn new(command: Vec<String>, workdir: impl Into<PathBuf>, timeout: Duration, output_limit: usize) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            view: None,
            timeout,
            output_limit,
        }
    }

    pub fn with_view(mut self, view: WorkspaceView) -> Self {
        self.view = Some(view);
        self
    }
}

impl AgentExecutor for CommandAgent {
    #[instrument(skip_all, fields(role = request.role, timeout_secs = self.timeout.as_secs()))]
    fn exec(&self, request: &AgentRequest) -> Result<()> {
        let workdir = match &self.view {
            Some(view) => view
                .materialize()
                .with_context(|| format!("prepare {} workspace view", request.role))?,
            None => self.workdir.clone(),
        };
        let output_path = request.output_path.to_string_lossy();
        let cmd = command_from_argv(&self.command, &workdir, &[("output", &output_path)])?;
        info!(program = self.command.first().map(String::as_str), "starting agent");
        let output = run_command(cmd, Some(request.prompt.as_bytes()), self.timeout, self.output_limit)
            .with_context(|| format!("run {} agent", request.role))?;
        write_agent_log(&request.log_path, &output)?;

        if output.timed_out {
            warn!("agent timed out");
            bail!("{} agent timed out after {:?}", request.role, self.timeout);
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            bail!(
                "{} agent failed with status {:?} (log: {})",
                request.role,
                output.status.code(),
                request.log_path.display()
            );
        }
        debug!("agent finished");
        Ok(())
    }
}

fn write_agent_log(path: &Path, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create log dir {}", parent.display()))?;
    }
    fs::write(path, output.combined_text()).with_context(|| format!("write agent log {}", path.display()))
}

/// Run the agent, then read, schema-check and decode its answer.
#[instrument(skip_all, fields(role = request.role))]
pub fn exec_and_load<T: DeserializeOwned>(
    executor: &dyn AgentExecutor,
    request: &AgentRequest,
    schema: &str,
) -> Result<T> {
    match fs::remove_file(&request.output_path) {
        Ok(()) => debug!("removed stale agent output"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("remove {}", request.output_path.display()));
        }
    }
    if let Some(parent) = request.output_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create output dir {}", parent.display()))?;
    }
    executor.exec(request)?;
    if !request.output_path.exists() {
        return Err(anyhow!(
            "{} agent wrote no output to {}",
            request.role,
            request.output_path.display()
        ));
    }
    let raw = fs::read_to_string(&request.output_path)
        .with_context(|| format!("read agent output {}", request.output_path.display()))?;
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", request.output_path.display()))?;
    validate_against(&value, schema).with_context(|| format!("{} agent output", request.role))?;
    serde_json::from_value(value).with_context(|| format!("decode {} agent output", request.role))
}

/// Shared plumbing for the three roles: one executor, the prompt engine and
/// a scratch directory for prompts, answers and logs.
pub struct AgentRole {
    role: &'static str,
    executor: Arc<dyn AgentExecutor>,
    prompts: Arc<PromptEngine>,
    scratch: PathBuf,
    calls: AtomicU64,
}

impl AgentRole {
    pub fn new(role: &'static str, executor: Arc<dyn AgentExecutor>, prompts: Arc<PromptEngine>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            role,
            executor,
            prompts,
            scratch: scratch.into(),
            calls: AtomicU64::new(0),
        }
    }

    fn invoke<T: DeserializeOwned>(&self, prompt: String, schema: &str) -> Result<T> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let stem = format!("{}-{n:03}", self.role);
        let prompt_path = self.scratch.join(format!("{stem}.prompt.md"));
        fs::create_dir_all(&self.scratch)
            .with_context(|| format!("create scratch dir {}", self.scratch.display()))?;
        fs::write(&prompt_path, &prompt).with_context(|| format!("write {}", prompt_path.display()))?;
        let request = AgentRequest {
            role: self.role,
            prompt,
            output_path: self.scratch.join(format!("{stem}.json")),
            log_path: self.scratch.join(format!("{stem}.log")),
        };
        exec_and_load(self.executor.as_ref(), &request, schema)
    }
}

pub struct AgentTester {
    pub role: AgentRole,
}

impl Tester for AgentTester {
    fn write_test(&self, brief: &TesterBrief) -> Result<TestCaseSource> {
        let prompt = self.role.prompts.render_tester(brief)?;
        self.role.invoke(prompt, TEST_CASE_SCHEMA)
    }
}

pub struct AgentReviewer {
    pub role: AgentRole,
}

impl Reviewer for AgentReviewer {
    fn review(&self, brief: &ReviewBrief) -> Result<MatchVerdict> {
        let prompt = self.role.prompts.render_reviewer(brief)?;
        self.role.invoke(prompt, VERDICT_SCHEMA)
    }
}

pub struct AgentImplementer {
    pub role: AgentRole,
    pub tests_dir: String,
}

impl Implementer for AgentImplementer {
    fn implement(&self, brief: &ImplementerBrief) -> Result<SourceModification> {
        let prompt = self.role.prompts.render_implementer(brief, &self.tests_dir)?;
        self.role.invoke(prompt, MODIFICATION_SCHEMA)
    }
}
