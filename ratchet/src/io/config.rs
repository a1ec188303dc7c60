//! Ratchet configuration stored under `.ratchet/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::AttemptBudget;
use crate::cycle::CycleSettings;

/// Ratchet configuration (TOML).
///
/// Edited by humans; every field has a default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RatchetConfig {
    /// Rejected Red attempts allowed per cycle before the run fails closed.
    pub red_attempt_budget: u32,

    /// Rejected Green attempts allowed per cycle before the run fails closed.
    pub green_attempt_budget: u32,

    /// Wall-clock bound on a single node invocation; `0` disables it.
    pub node_timeout_secs: u64,

    /// Timeout for each external command (agents, tests, coverage).
    pub command_timeout_secs: u64,

    pub coverage_granularity: CoverageGranularity,

    /// Truncate captured command output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Byte budget for rendered agent prompts.
    pub prompt_budget_bytes: usize,

    /// Workspace-relative directory the tester owns.
    pub tests_dir: String,

    pub agents: AgentsConfig,
    pub tests: TestsConfig,
    pub compile: CompileConfig,
    pub coverage: CoverageConfig,
}

/// How coverage of an added line is decided.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoverageGranularity {
    /// A line counts as covered once it executes.
    #[default]
    Line,
    /// A line with branches counts only once every branch was taken.
    Branch,
}

/// Commands backing the three agent roles.
///
/// Each command receives the prompt on stdin; `{output}` in any argument is
/// replaced by the path the agent must write its JSON answer to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentsConfig {
    pub tester: Vec<String>,
    pub reviewer: Vec<String>,
    pub implementer: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestsConfig {
    /// Command running the whole suite.
    pub command: Vec<String>,
    /// Regex with `name` and `status` groups, matched per output line.
    pub result_pattern: String,
    /// Status values counted as a pass.
    pub pass_statuses: Vec<String>,
    /// Status values left out of the inventory entirely. Any other status is
    /// a failure.
    pub ignore_statuses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompileConfig {
    /// Command type-checking the suite; the new test source arrives on stdin.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoverageConfig {
    /// Command running one test under coverage; `{test}` is the test id.
    pub command: Vec<String>,
    /// Workspace-relative lcov report the command writes. Keep it under
    /// `.ratchet/` so Green's commit never picks it up.
    pub report_path: String,
}

fn agent_command() -> Vec<String> {
    ["codex", "exec", "--output-last-message", "{output}", "-"]
        .map(str::to_string)
        .to_vec()
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            tester: agent_command(),
            reviewer: agent_command(),
            implementer: agent_command(),
        }
    }
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            command: vec!["cargo".to_string(), "test".to_string()],
            result_pattern: r"^test (?P<name>\S+) \.\.\. (?P<status>\w+)$".to_string(),
            pass_statuses: vec!["ok".to_string()],
            ignore_statuses: vec!["ignored".to_string()],
        }
    }
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            command: ["cargo", "test", "--no-run"].map(str::to_string).to_vec(),
        }
    }
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            command: [
                "cargo",
                "llvm-cov",
                "--lcov",
                "--output-path",
                ".ratchet/lcov.info",
                "--",
                "--exact",
                "{test}",
            ]
            .map(str::to_string)
            .to_vec(),
            report_path: ".ratchet/lcov.info".to_string(),
        }
    }
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            red_attempt_budget: 3,
            green_attempt_budget: 5,
            node_timeout_secs: 30 * 60,
            command_timeout_secs: 10 * 60,
            coverage_granularity: CoverageGranularity::Line,
            output_limit_bytes: 100_000,
            prompt_budget_bytes: 60_000,
            tests_dir: "tests".to_string(),
            agents: AgentsConfig::default(),
            tests: TestsConfig::default(),
            compile: CompileConfig::default(),
            coverage: CoverageConfig::default(),
        }
    }
}

fn require_command(name: &str, command: &[String]) -> Result<()> {
    match command.first() {
        Some(program) if !program.trim().is_empty() => Ok(()),
        _ => Err(anyhow!("{name} must be a non-empty array")),
    }
}

impl RatchetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.red_attempt_budget == 0 {
            return Err(anyhow!("red_attempt_budget must be > 0"));
        }
        if self.green_attempt_budget == 0 {
            return Err(anyhow!("green_attempt_budget must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        let tests_dir = self.tests_dir.trim_matches('/');
        if tests_dir.is_empty() || tests_dir.split('/').any(|part| part == "..") {
            return Err(anyhow!("tests_dir must be a relative directory inside the workspace"));
        }
        require_command("agents.tester", &self.agents.tester)?;
        require_command("agents.reviewer", &self.agents.reviewer)?;
        require_command("agents.implementer", &self.agents.implementer)?;
        require_command("tests.command", &self.tests.command)?;
        require_command("compile.command", &self.compile.command)?;
        require_command("coverage.command", &self.coverage.command)?;
        regex::Regex::new(&self.tests.result_pattern).context("tests.result_pattern")?;
        if self.tests.pass_statuses.is_empty() {
            return Err(anyhow!("tests.pass_statuses must not be empty"));
        }
        if self.coverage.report_path.trim().is_empty() {
            return Err(anyhow!("coverage.report_path must not be empty"));
        }
        Ok(())
    }

    pub fn node_timeout(&self) -> Option<Duration> {
        (self.node_timeout_secs > 0).then(|| Duration::from_secs(self.node_timeout_secs))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn cycle_settings(&self) -> CycleSettings {
        CycleSettings {
            red_budget: AttemptBudget::new(self.red_attempt_budget),
            green_budget: AttemptBudget::new(self.green_attempt_budget),
            tests_dir: self.tests_dir.trim_matches('/').to_string(),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RatchetConfig::default()`.
pub fn load_config(path: &Path) -> Result<RatchetConfig> {
    if !path.exists() {
        let cfg = RatchetConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RatchetConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RatchetConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))
}
