//! [`CompileChecker`] backed by the configured build command.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument};

use crate::capability::CompileChecker;
use crate::core::types::{CompileVerdict, TestCaseSource};
use crate::io::process::{command_from_argv, run_command};

/// Runs the compile command in the workspace with the new test's source on
/// stdin and `{path}` substituted by its path. Non-zero exit is a compile
/// error carrying the command's output.
#[derive(Debug, Clone)]
pub struct CommandCompileChecker {
    workdir: PathBuf,
    command: Vec<String>,
    timeout: Duration,
    output_limit: usize,
}

impl CommandCompileChecker {
    pub fn new(workdir: impl Into<PathBuf>, command: Vec<String>, timeout: Duration, output_limit: usize) -> Self {
        Self {
            workdir: workdir.into(),
            command,
            timeout,
            output_limit,
        }
    }
}

impl CompileChecker for CommandCompileChecker {
    #[instrument(skip_all, fields(test = %source.id))]
    fn check(&self, source: &TestCaseSource) -> Result<CompileVerdict> {
        let cmd = command_from_argv(&self.command, &self.workdir, &[("path", &source.path)])?;
        let output = run_command(cmd, Some(source.source.as_bytes()), self.timeout, self.output_limit)
            .context("run compile check")?;
        if output.timed_out {
            bail!("compile check timed out after {:?}", self.timeout);
        }
        debug!(exit_code = ?output.status.code(), "compile check finished");
        if output.status.success() {
            Ok(CompileVerdict::Ok)
        } else {
            Ok(CompileVerdict::Error(output.combined_text()))
        }
    }
}
