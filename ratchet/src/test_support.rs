//! Test-only helpers: scripted role providers, an in-memory simulated
//! project, envelope builders and a throwaway git repository.
//!
//! The simulated project understands a tiny line language so that gates can
//! be exercised without a real toolchain:
//!
//! - source files (anything outside `tests/`) define symbols with `fn <name>`
//!   lines; the lines up to the next `fn` belong to that symbol
//! - test files (`tests/<id>.t`) contain `assert <name>` lines and pass when
//!   every asserted symbol is defined
//! - a test executes the lines of each symbol it asserts, except lines
//!   starting with `unreachable`
//! - a line starting with `!!` is a compile error

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::capability::{
    Capabilities, CompileChecker, CoverageMeter, Implementer, ImplementerBrief, MatchVerdict,
    ReviewBrief, Reviewer, SourceModification, TestRunner, Tester, TesterBrief, Workspace,
};
use crate::core::types::{
    CompileVerdict, CoverageResult, CycleRecord, FileEdit, Phase, Requirement, SourceLine,
    StateEnvelope, TestCaseSource, TestRunResult, WorkspaceMark,
};

const TESTS_PREFIX: &str = "tests/";

#[derive(Debug, Default)]
struct SimState {
    files: BTreeMap<String, String>,
    marks: Vec<BTreeMap<String, String>>,
    test_runs: usize,
    coverage_runs: usize,
}

/// In-memory project implementing the workspace, test runner, coverage and
/// compile capabilities. Clones share state, so one project can back every
/// slot of a capability table and survive a simulated process restart.
#[derive(Debug, Clone, Default)]
pub struct SimProject {
    inner: Arc<Mutex<SimState>>,
}

impl SimProject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a file directly, bypassing any role.
    pub fn seed(&self, path: &str, contents: &str) {
        self.lock().files.insert(path.to_string(), contents.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).cloned()
    }

    pub fn test_runs(&self) -> usize {
        self.lock().test_runs
    }

    pub fn coverage_runs(&self) -> usize {
        self.lock().coverage_runs
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_test_path(path: &str) -> bool {
    path.starts_with(TESTS_PREFIX)
}

fn test_id(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn has_compile_error(source: &str) -> bool {
    source.lines().any(|l| l.trim_start().starts_with("!!"))
}

fn asserted(source: &str) -> Vec<String> {
    source
        .lines()
        .filter_map(|l| l.trim().strip_prefix("assert "))
        .map(|s| s.trim().to_string())
        .collect()
}

fn defined(files: &BTreeMap<String, String>) -> BTreeSet<String> {
    files
        .iter()
        .filter(|(path, _)| !is_test_path(path))
        .flat_map(|(_, body)| body.lines())
        .filter_map(|l| l.trim().strip_prefix("fn "))
        .map(|s| s.trim().to_string())
        .collect()
}

fn parse_mark(mark: &WorkspaceMark) -> Result<usize> {
    mark.as_str()
        .strip_prefix('m')
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .ok_or_else(|| anyhow!("unknown mark {}", mark.as_str()))
}

impl Workspace for SimProject {
    fn mark(&self, _label: &str) -> Result<WorkspaceMark> {
        let mut state = self.lock();
        let snapshot = state.files.clone();
        state.marks.push(snapshot);
        Ok(WorkspaceMark(format!("m{}", state.marks.len())))
    }

    fn rewind(&self, mark: &WorkspaceMark) -> Result<()> {
        let index = parse_mark(mark)?;
        let mut state = self.lock();
        let snapshot = state
            .marks
            .get(index - 1)
            .cloned()
            .ok_or_else(|| anyhow!("unknown mark {}", mark.as_str()))?;
        state.files = snapshot;
        Ok(())
    }

    fn apply(&self, edits: &[FileEdit]) -> Result<()> {
        let mut state = self.lock();
        for edit in edits {
            match &edit.contents {
                Some(contents) => {
                    state.files.insert(edit.path.clone(), contents.clone());
                }
                None => {
                    state.files.remove(&edit.path);
                }
            }
        }
        Ok(())
    }

    fn added_lines(&self, since: &WorkspaceMark) -> Result<BTreeSet<SourceLine>> {
        let index = parse_mark(since)?;
        let state = self.lock();
        let base = state
            .marks
            .get(index - 1)
            .ok_or_else(|| anyhow!("unknown mark {}", since.as_str()))?;
        let mut added = BTreeSet::new();
        for (path, body) in &state.files {
            let mut old: BTreeMap<&str, usize> = BTreeMap::new();
            for line in base.get(path).map(String::as_str).unwrap_or_default().lines() {
                *old.entry(line).or_default() += 1;
            }
            for (i, line) in body.lines().enumerate() {
                match old.get_mut(line) {
                    Some(count) if *count > 0 => *count -= 1,
                    _ => {
                        added.insert(SourceLine::new(path.clone(), i as u32 + 1));
                    }
                }
            }
        }
        Ok(added)
    }
}

impl TestRunner for SimProject {
    fn run_tests(&self) -> Result<TestRunResult> {
        let mut state = self.lock();
        state.test_runs += 1;
        let tests: Vec<(&String, &String)> =
            state.files.iter().filter(|(path, _)| is_test_path(path)).collect();
        if let Some((path, _)) = tests.iter().find(|(_, body)| has_compile_error(body)) {
            return Ok(TestRunResult::from_sets(
                BTreeSet::new(),
                BTreeSet::new(),
                format!("compile error in {path}\n"),
            ));
        }
        let symbols = defined(&state.files);
        let mut passed = BTreeSet::new();
        let mut failed = BTreeSet::new();
        let mut output = String::new();
        for (path, body) in tests {
            let id = test_id(path);
            let missing: Vec<String> = asserted(body)
                .into_iter()
                .filter(|sym| !symbols.contains(sym))
                .collect();
            if missing.is_empty() {
                output.push_str(&format!("ok {id}\n"));
                passed.insert(id);
            } else {
                output.push_str(&format!("FAILED {id}: {} is not defined\n", missing.join(", ")));
                failed.insert(id);
            }
        }
        Ok(TestRunResult::from_sets(passed, failed, output))
    }
}

impl CoverageMeter for SimProject {
    fn measure(&self, added: &BTreeSet<SourceLine>, test: &str) -> Result<CoverageResult> {
        let mut state = self.lock();
        state.coverage_runs += 1;
        let body = state
            .files
            .iter()
            .find(|(path, _)| is_test_path(path) && test_id(path) == test)
            .map(|(_, body)| body.clone())
            .ok_or_else(|| anyhow!("no test named {test}"))?;
        let symbols: BTreeSet<String> = asserted(&body).into_iter().collect();

        let mut executed = BTreeSet::new();
        for (path, source) in state.files.iter().filter(|(path, _)| !is_test_path(path)) {
            let mut current: Option<&str> = None;
            for (i, line) in source.lines().enumerate() {
                let trimmed = line.trim();
                if let Some(name) = trimmed.strip_prefix("fn ") {
                    current = Some(name.trim());
                }
                let live = current.is_some_and(|name| symbols.contains(name));
                if live && !trimmed.starts_with("unreachable") {
                    let loc = SourceLine::new(path.clone(), i as u32 + 1);
                    if added.contains(&loc) {
                        executed.insert(loc);
                    }
                }
            }
        }
        Ok(CoverageResult {
            executed_lines: executed,
        })
    }
}

impl CompileChecker for SimProject {
    fn check(&self, source: &TestCaseSource) -> Result<CompileVerdict> {
        if has_compile_error(&source.source) {
            return Ok(CompileVerdict::Error(format!("syntax error in {}", source.path)));
        }
        Ok(CompileVerdict::Ok)
    }
}

/// A simulated test file for `id` with the given body.
pub fn sim_test(id: &str, body: &str) -> TestCaseSource {
    TestCaseSource {
        id: id.to_string(),
        path: format!("{TESTS_PREFIX}{id}.t"),
        source: format!("{body}\n"),
    }
}

/// Tester that hands out queued tests in order.
#[derive(Debug, Default)]
pub struct ScriptedTester {
    queue: Mutex<VecDeque<TestCaseSource>>,
    briefs: Mutex<Vec<TesterBrief>>,
}

impl Tester for ScriptedTester {
    fn write_test(&self, brief: &TesterBrief) -> Result<TestCaseSource> {
        self.briefs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(brief.clone());
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| anyhow!("scripted tester has no more tests"))
    }
}

/// Reviewer that replays queued verdicts, then accepts everything.
#[derive(Debug, Default)]
pub struct ScriptedReviewer {
    queue: Mutex<VecDeque<MatchVerdict>>,
    calls: AtomicUsize,
}

impl Reviewer for ScriptedReviewer {
    fn review(&self, _brief: &ReviewBrief) -> Result<MatchVerdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(MatchVerdict::Accept))
    }
}

/// Implementer that replays queued modifications or errors.
#[derive(Debug, Default)]
pub struct ScriptedImplementer {
    queue: Mutex<VecDeque<Result<SourceModification, String>>>,
    briefs: Mutex<Vec<ImplementerBrief>>,
}

impl Implementer for ScriptedImplementer {
    fn implement(&self, brief: &ImplementerBrief) -> Result<SourceModification> {
        self.briefs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(brief.clone());
        match self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            Some(Ok(modification)) => Ok(modification),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted implementer has no more modifications")),
        }
    }
}

/// The three agent roles, scripted, with shared call counters.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRoles {
    tester: Arc<ScriptedTester>,
    reviewer: Arc<ScriptedReviewer>,
    implementer: Arc<ScriptedImplementer>,
}

impl ScriptedRoles {
    pub fn tester(self, test: TestCaseSource) -> Self {
        self.tester
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(test);
        self
    }

    pub fn reject(self, reason: &str) -> Self {
        self.push_verdict(MatchVerdict::Reject {
            reason: reason.to_string(),
        });
        self
    }

    pub fn accept(self) -> Self {
        self.push_verdict(MatchVerdict::Accept);
        self
    }

    pub fn implementer(self, edits: Vec<FileEdit>) -> Self {
        self.push_implementation(Ok(SourceModification {
            edits,
            summary: String::new(),
        }));
        self
    }

    pub fn implementer_error(self, message: &str) -> Self {
        self.push_implementation(Err(message.to_string()));
        self
    }

    fn push_verdict(&self, verdict: MatchVerdict) {
        self.reviewer
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(verdict);
    }

    fn push_implementation(&self, item: Result<SourceModification, String>) {
        self.implementer
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(item);
    }

    pub fn tester_calls(&self) -> usize {
        self.tester_briefs().len()
    }

    pub fn tester_briefs(&self) -> Vec<TesterBrief> {
        self.tester
            .briefs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reviewer_calls(&self) -> usize {
        self.reviewer.calls.load(Ordering::SeqCst)
    }

    pub fn implementer_calls(&self) -> usize {
        self.implementer_briefs().len()
    }

    pub fn implementer_briefs(&self) -> Vec<ImplementerBrief> {
        self.implementer
            .briefs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Capability table with these roles and `project` behind every
    /// non-agent slot.
    pub fn capabilities(&self, project: &SimProject) -> Capabilities {
        Capabilities {
            tester: self.tester.clone(),
            reviewer: self.reviewer.clone(),
            implementer: self.implementer.clone(),
            tests: Arc::new(project.clone()),
            coverage: Arc::new(project.clone()),
            compiler: Arc::new(project.clone()),
            workspace: Arc::new(project.clone()),
        }
    }
}

/// Fresh envelope with `(id, text)` requirements queued.
pub fn envelope(requirements: &[(&str, &str)]) -> StateEnvelope {
    StateEnvelope::new(
        "simulated project",
        requirements
            .iter()
            .map(|(id, text)| Requirement {
                id: id.to_string(),
                text: text.to_string(),
            })
            .collect(),
    )
}

/// Envelope as `select` would leave it: baseline recorded from `project`,
/// a Red cycle open for one requirement.
pub fn envelope_in_red(project: &SimProject, requirement_id: &str, text: &str) -> StateEnvelope {
    let run = project.run_tests().expect("baseline run");
    let mark = project.mark("baseline").expect("baseline mark");
    let requirement = Requirement {
        id: requirement_id.to_string(),
        text: text.to_string(),
    };
    StateEnvelope {
        test_count: run.total,
        passing: run.passed.clone(),
        baseline: Some(mark),
        cycle: Some(CycleRecord::open(requirement, run.total, run.passed)),
        ..envelope(&[])
    }
}

/// Envelope as a committed Red would leave it: the failing test `test_id`
/// (body `assert_line`) is in the workspace and marked.
pub fn envelope_in_green(project: &SimProject, test_id: &str, assert_line: &str) -> StateEnvelope {
    let mut state = envelope_in_red(project, test_id, &format!("requirement for {test_id}"));
    let test = sim_test(test_id, assert_line);
    project
        .apply(&[FileEdit::write(&test.path, &test.source)])
        .expect("write test");
    let run = project.run_tests().expect("red run");
    let red_mark = project.mark("red").expect("red mark");
    state.test_count += 1;
    if let Some(cycle) = state.cycle.as_mut() {
        cycle.phase = Phase::Green;
        cycle.test = Some(test);
        cycle.failure_output = Some(run.output);
        cycle.red_mark = Some(red_mark);
    }
    state
}

/// Throwaway git repository with an initial commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "ratchet@example.com"])?;
        repo.git(&["config", "user.name", "Ratchet Tests"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "# fixture\n")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "initial"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.path().join(rel)).ok()
    }

    /// Run git in the repository and return stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
