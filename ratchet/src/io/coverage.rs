//! [`CoverageMeter`] reading lcov reports.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument, warn};

use crate::capability::CoverageMeter;
use crate::core::types::{CoverageResult, SourceLine};
use crate::io::config::{CoverageConfig, CoverageGranularity};
use crate::io::process::{command_from_argv, run_command};

/// Per-line execution data from one lcov report.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LcovReport {
    /// `DA` hit counts.
    pub hits: BTreeMap<SourceLine, u64>,
    /// `BRDA` branches per line: `(total, taken)`.
    pub branches: BTreeMap<SourceLine, (u32, u32)>,
}

impl LcovReport {
    /// Lines that count as executed under `granularity`.
    pub fn executed(&self, granularity: CoverageGranularity) -> BTreeSet<SourceLine> {
        self.hits
            .iter()
            .filter(|(_, hits)| **hits > 0)
            .map(|(line, _)| line)
            .filter(|line| match granularity {
                CoverageGranularity::Line => true,
                CoverageGranularity::Branch => self
                    .branches
                    .get(*line)
                    .is_none_or(|(total, taken)| total == taken),
            })
            .cloned()
            .collect()
    }
}

/// Parse an lcov tracefile. `SF` paths under `root` are made relative to it
/// so they line up with workspace diffs.
pub fn parse_lcov(text: &str, root: &Path) -> Result<LcovReport> {
    let mut report = LcovReport::default();
    let mut file: Option<String> = None;
    for (n, raw) in text.lines().enumerate() {
        let line = raw.trim();
        let Some((tag, value)) = line.split_once(':') else {
            if line == "end_of_record" {
                file = None;
            }
            continue;
        };
        match tag {
            "SF" => file = Some(relativize(value, root)),
            "DA" | "BRDA" => {
                let Some(path) = &file else {
                    bail!("lcov line {}: {tag} outside a file record", n + 1);
                };
                let fields: Vec<&str> = value.split(',').collect();
                let line_no: u32 = fields[0]
                    .parse()
                    .with_context(|| format!("lcov line {}: bad line number", n + 1))?;
                let loc = SourceLine::new(path.clone(), line_no);
                if tag == "DA" {
                    let hits: u64 = fields
                        .get(1)
                        .and_then(|h| h.parse().ok())
                        .with_context(|| format!("lcov line {}: bad hit count", n + 1))?;
                    *report.hits.entry(loc).or_default() += hits;
                } else {
                    let taken = fields.get(3).is_some_and(|t| *t != "-" && *t != "0");
                    let entry = report.branches.entry(loc).or_default();
                    entry.0 += 1;
                    entry.1 += u32::from(taken);
                }
            }
            _ => {}
        }
    }
    Ok(report)
}

fn relativize(path: &str, root: &Path) -> String {
    let candidate = Path::new(path);
    candidate
        .strip_prefix(root)
        .unwrap_or(candidate)
        .to_string_lossy()
        .into_owned()
}

/// Runs the coverage command for a single test and intersects the report
/// with the added lines.
#[derive(Debug, Clone)]
pub struct LcovCoverageMeter {
    workdir: PathBuf,
    config: CoverageConfig,
    granularity: CoverageGranularity,
    timeout: Duration,
    output_limit: usize,
}

impl LcovCoverageMeter {
    pub fn new(
        workdir: impl Into<PathBuf>,
        config: CoverageConfig,
        granularity: CoverageGranularity,
        timeout: Duration,
        output_limit: usize,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            config,
            granularity,
            timeout,
            output_limit,
        }
    }
}

impl CoverageMeter for LcovCoverageMeter {
    #[instrument(skip_all, fields(test = test_id, added = added.len()))]
    fn measure(&self, added: &BTreeSet<SourceLine>, test_id: &str) -> Result<CoverageResult> {
        let report_path = self.workdir.join(&self.config.report_path);
        if report_path.exists() {
            fs::remove_file(&report_path)
                .with_context(|| format!("remove stale report {}", report_path.display()))?;
        }
        let cmd = command_from_argv(&self.config.command, &self.workdir, &[("test", test_id)])?;
        let output = run_command(cmd, None, self.timeout, self.output_limit).context("run coverage")?;
        if output.timed_out {
            bail!("coverage run timed out after {:?}", self.timeout);
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "coverage command failed");
            bail!("coverage command failed:\n{}", output.combined_text());
        }
        let text = fs::read_to_string(&report_path)
            .with_context(|| format!("read coverage report {}", report_path.display()))?;
        let root = self.workdir.canonicalize().unwrap_or_else(|_| self.workdir.clone());
        let report = parse_lcov(&text, &root)?;
        let executed: BTreeSet<SourceLine> = report
            .executed(self.granularity)
            .intersection(added)
            .cloned()
            .collect();
        debug!(executed = executed.len(), "coverage measured");
        Ok(CoverageResult {
            executed_lines: executed,
        })
    }
}
