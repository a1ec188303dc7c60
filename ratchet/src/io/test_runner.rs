//! [`TestRunner`] that runs the configured suite command and reads per-test
//! results out of its output.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::capability::TestRunner;
use crate::core::types::TestRunResult;
use crate::io::config::TestsConfig;
use crate::io::process::{cap_text, command_from_argv, run_command};

#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    workdir: PathBuf,
    command: Vec<String>,
    pattern: Regex,
    pass_statuses: Vec<String>,
    ignore_statuses: Vec<String>,
    timeout: Duration,
    output_limit: usize,
}

impl CommandTestRunner {
    pub fn new(
        workdir: impl Into<PathBuf>,
        config: &TestsConfig,
        timeout: Duration,
        output_limit: usize,
    ) -> Result<Self> {
        let pattern = Regex::new(&config.result_pattern).context("compile tests.result_pattern")?;
        for group in ["name", "status"] {
            if !pattern.capture_names().any(|n| n == Some(group)) {
                bail!("tests.result_pattern is missing the `{group}` group");
            }
        }
        Ok(Self {
            workdir: workdir.into(),
            command: config.command.clone(),
            pattern,
            pass_statuses: config.pass_statuses.clone(),
            ignore_statuses: config.ignore_statuses.clone(),
            timeout,
            output_limit,
        })
    }

    /// Classify every matching line of `output`. A test reported more than
    /// once counts as failed if any report is a failure; ignored tests are
    /// not part of the inventory.
    pub fn parse(&self, output: &str) -> (BTreeSet<String>, BTreeSet<String>) {
        let mut passed = BTreeSet::new();
        let mut failed = BTreeSet::new();
        for line in output.lines() {
            let Some(caps) = self.pattern.captures(line.trim_end()) else {
                continue;
            };
            let (Some(name), Some(status)) = (caps.name("name"), caps.name("status")) else {
                continue;
            };
            let name = name.as_str().to_string();
            if self.ignore_statuses.iter().any(|s| s == status.as_str()) {
                continue;
            }
            if self.pass_statuses.iter().any(|s| s == status.as_str()) {
                passed.insert(name);
            } else {
                failed.insert(name);
            }
        }
        passed.retain(|name| !failed.contains(name));
        (passed, failed)
    }
}

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(command = %self.command.join(" ")))]
    fn run_tests(&self) -> Result<TestRunResult> {
        let cmd = command_from_argv(&self.command, &self.workdir, &[])?;
        // The inventory comes from the full stream; only the kept text is capped.
        let output = run_command(cmd, None, self.timeout, usize::MAX).context("run test suite")?;
        if output.timed_out {
            bail!("test suite timed out after {:?}", self.timeout);
        }
        let text = output.combined_text();
        let (passed, failed) = self.parse(&text);
        if !output.status.success() && failed.is_empty() {
            // Usually a build error. The inventory it yields is short, so the
            // count checks reject it.
            warn!(exit_code = ?output.status.code(), "suite failed without reporting failures");
        }
        debug!(passed = passed.len(), failed = failed.len(), "suite finished");
        Ok(TestRunResult::from_sets(passed, failed, cap_text(text, self.output_limit)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner_with_limit(command: &[&str], output_limit: usize) -> CommandTestRunner {
        let config = TestsConfig {
            command: command.iter().map(ToString::to_string).collect(),
            ..TestsConfig::default()
        };
        CommandTestRunner::new(".", &config, Duration::from_secs(10), output_limit).expect("runner")
    }

    fn runner(command: &[&str]) -> CommandTestRunner {
        runner_with_limit(command, 10_000)
    }

    #[test]
    fn parses_cargo_style_lines() {
        let runner = runner(&["true"]);
        let (passed, failed) = runner.parse(
            "running 3 tests\n\
             test math::adds ... ok\n\
             test math::subs ... FAILED\n\
             test math::slow ... ignored\n\
             test result: FAILED. 1 passed; 1 failed\n",
        );
        assert_eq!(passed.into_iter().collect::<Vec<_>>(), vec!["math::adds"]);
        assert_eq!(failed.into_iter().collect::<Vec<_>>(), vec!["math::subs"]);
    }

    #[test]
    fn runs_command_and_counts_tests() {
        let runner = runner(&["sh", "-c", "echo 'test a ... ok'; echo 'test b ... FAILED'; exit 101"]);
        let result = runner.run_tests().expect("run");
        assert_eq!(result.total, 2);
        assert!(result.passed.contains("a"));
        assert!(result.failed.contains("b"));
        assert!(result.output.contains("test b ... FAILED"));
    }

    /// Results past the output limit still count toward the inventory.
    #[test]
    fn inventory_survives_output_limit() {
        let runner = runner_with_limit(
            &["sh", "-c", "for i in 1 2 3 4 5; do echo \"test t$i ... ok\"; done"],
            40,
        );
        let result = runner.run_tests().expect("run");
        assert_eq!(result.total, 5);
        assert!(result.passed.contains("t5"));
        assert!(result.output.contains("[output truncated"), "{}", result.output);
        assert!(!result.output.contains("t5"));
    }

    #[test]
    fn pattern_without_groups_is_rejected() {
        let config = TestsConfig {
            result_pattern: r"^test (\S+)$".to_string(),
            ..TestsConfig::default()
        };
        assert!(CommandTestRunner::new(".", &config, Duration::from_secs(1), 100).is_err());
    }
}
