//! Git adapter and the git-backed [`Workspace`].
//!
//! Marks are commits. Every committed phase becomes one commit on the
//! current branch, so `git log` reads as the ratchet's history and a rewind
//! is a hard reset plus a clean of untracked files. `.ratchet/` is excluded
//! from staging and cleaning whether or not it is git-ignored.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Output};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use tracing::{debug, instrument};

use crate::capability::Workspace;
use crate::core::types::{FileEdit, SourceLine, WorkspaceMark};

/// Ratchet's own state directory at the workspace root.
const STATE_DIR: &str = ".ratchet";

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Full sha of HEAD.
    pub fn head(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Stage all changes outside `.ratchet/` (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        let exclude = format!(":(exclude){STATE_DIR}");
        self.run_checked(&["add", "-A", "--", ".", exclude.as_str()])?;
        Ok(())
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--quiet"])?;
        match out.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(anyhow!(
                "git diff --cached --quiet failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        }
    }

    /// Commit whatever is staged. Returns false when nothing was staged.
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            return Ok(false);
        }
        self.run_checked(&["commit", "-q", "--no-verify", "-m", message])?;
        Ok(true)
    }

    /// Zero-context diff of the index against `rev`, with `a/`/`b/` prefixes
    /// and unescaped paths whatever the user's diff config says.
    pub fn diff_cached(&self, rev: &str) -> Result<String> {
        self.run_capture(&[
            "-c",
            "core.quotePath=false",
            "diff",
            "--cached",
            "-U0",
            "--no-color",
            "--no-ext-diff",
            "--src-prefix=a/",
            "--dst-prefix=b/",
            rev,
        ])
    }

    pub fn reset_hard(&self, rev: &str) -> Result<()> {
        self.run_checked(&["reset", "-q", "--hard", rev])?;
        Ok(())
    }

    /// Remove untracked files and directories; ignored files and `.ratchet/`
    /// stay.
    pub fn clean(&self) -> Result<()> {
        self.run_checked(&["clean", "-q", "-f", "-d", "-e", STATE_DIR])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Workspace backed by a git working tree.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    git: Git,
}

impl GitWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { git: Git::new(root) }
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let path = Path::new(rel);
        if rel.is_empty()
            || path
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("edit path {rel} escapes the workspace");
        }
        Ok(self.git.workdir().join(path))
    }
}

impl Workspace for GitWorkspace {
    #[instrument(skip_all, fields(label))]
    fn mark(&self, label: &str) -> Result<WorkspaceMark> {
        self.git.add_all()?;
        let committed = self.git.commit_staged(label)?;
        let head = self.git.head()?;
        debug!(committed, head = %head, "workspace marked");
        Ok(WorkspaceMark(head))
    }

    #[instrument(skip_all, fields(mark = mark.as_str()))]
    fn rewind(&self, mark: &WorkspaceMark) -> Result<()> {
        self.git.reset_hard(mark.as_str())?;
        self.git.clean()
    }

    fn apply(&self, edits: &[FileEdit]) -> Result<()> {
        for edit in edits {
            let path = self.resolve(&edit.path)?;
            match &edit.contents {
                Some(contents) => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)
                            .with_context(|| format!("create directory {}", parent.display()))?;
                    }
                    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
                }
                None => match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(err).with_context(|| format!("delete {}", path.display()));
                    }
                },
            }
        }
        Ok(())
    }

    fn added_lines(&self, since: &WorkspaceMark) -> Result<BTreeSet<SourceLine>> {
        self.git.add_all()?;
        let diff = self.git.diff_cached(since.as_str())?;
        parse_added_lines(&diff)
    }
}

static HUNK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -\d+(?:,\d+)? \+(\d+)(?:,(\d+))? @@").expect("hunk header pattern is valid")
});

/// Added `(file, line)` pairs from a `-U0` unified diff, new-file numbering.
/// A `+++` target that is neither `/dev/null` nor `b/<path>` is an error,
/// never a file to skip.
pub fn parse_added_lines(diff: &str) -> Result<BTreeSet<SourceLine>> {
    let mut added = BTreeSet::new();
    let mut file: Option<String> = None;
    // file headers only occur between `diff --git` and the first hunk, so an
    // added source line starting with `++ ` is never taken for one
    let mut in_header = true;
    for line in diff.lines() {
        if line.starts_with("diff --git ") {
            in_header = true;
            file = None;
            continue;
        }
        if in_header {
            if let Some(target) = line.strip_prefix("+++ ") {
                file = parse_target(target)?;
                continue;
            }
        }
        let Some(caps) = HUNK_RE.captures(line) else {
            continue;
        };
        in_header = false;
        let Some(path) = &file else {
            continue;
        };
        let start: u32 = caps[1].parse().with_context(|| format!("bad hunk header {line}"))?;
        let count: u32 = match caps.get(2) {
            Some(n) => n.as_str().parse().with_context(|| format!("bad hunk header {line}"))?,
            None => 1,
        };
        added.extend((start..start + count).map(|n| SourceLine::new(path.clone(), n)));
    }
    Ok(added)
}

/// Path named by a `+++` line, or `None` for a deleted file.
fn parse_target(raw: &str) -> Result<Option<String>> {
    // git appends a tab after names containing spaces
    let raw = raw.trim_end_matches('\t');
    if raw == "/dev/null" {
        return Ok(None);
    }
    let name = if raw.starts_with('"') {
        unquote_c_style(raw).with_context(|| format!("bad quoted diff target {raw}"))?
    } else {
        raw.to_string()
    };
    match name.strip_prefix("b/") {
        Some(path) if !path.is_empty() => Ok(Some(path.to_string())),
        _ => bail!("unrecognised diff target {raw}"),
    }
}

/// Undo git's C-style quoting of a path (`"b/caf\303\251.rs"`).
fn unquote_c_style(quoted: &str) -> Result<String> {
    let inner = quoted
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or_else(|| anyhow!("unterminated quote"))?;
    let mut bytes = Vec::with_capacity(inner.len());
    let mut chars = inner.bytes();
    while let Some(b) = chars.next() {
        if b != b'\\' {
            bytes.push(b);
            continue;
        }
        let escaped = chars.next().ok_or_else(|| anyhow!("dangling escape"))?;
        let byte = match escaped {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'v' => 0x0b,
            b'"' | b'\\' => escaped,
            b'0'..=b'7' => {
                let mut value = u32::from(escaped - b'0');
                for _ in 0..2 {
                    let digit = chars
                        .next()
                        .filter(|d| (b'0'..=b'7').contains(d))
                        .ok_or_else(|| anyhow!("short octal escape"))?;
                    value = value * 8 + u32::from(digit - b'0');
                }
                u8::try_from(value).map_err(|_| anyhow!("octal escape out of range"))?
            }
            other => bail!("unknown escape \\{}", char::from(other)),
        };
        bytes.push(byte);
    }
    String::from_utf8(bytes).context("quoted path is not utf-8")
}
