//! Read-restricted copies of the workspace for agent processes.
//!
//! A command agent never runs in the live tree. Each invocation gets a fresh
//! copy holding only what its role may read: the implementer sees everything
//! except the tests directory, the tester and reviewer see only the tests
//! directory. `.git` and `.ratchet` are never copied.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use walkdir::WalkDir;

/// Which part of the workspace a role may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Everything but the tests directory.
    ExceptTests,
    /// The tests directory alone.
    TestsOnly,
}

#[derive(Debug, Clone)]
pub struct WorkspaceView {
    root: PathBuf,
    dest: PathBuf,
    tests_dir: PathBuf,
    visibility: Visibility,
}

const NEVER_COPIED: [&str; 2] = [".git", ".ratchet"];

impl WorkspaceView {
    pub fn new(
        root: impl Into<PathBuf>,
        dest: impl Into<PathBuf>,
        tests_dir: &str,
        visibility: Visibility,
    ) -> Self {
        Self {
            root: root.into(),
            dest: dest.into(),
            tests_dir: PathBuf::from(tests_dir.trim_matches('/')),
            visibility,
        }
    }

    fn descend(&self, rel: &Path) -> bool {
        if rel
            .components()
            .next()
            .is_some_and(|first| NEVER_COPIED.iter().any(|name| first.as_os_str() == *name))
        {
            return false;
        }
        match self.visibility {
            Visibility::ExceptTests => !rel.starts_with(&self.tests_dir),
            // ancestors of the tests directory are walked but not copied
            Visibility::TestsOnly => rel.starts_with(&self.tests_dir) || self.tests_dir.starts_with(rel),
        }
    }

    fn copies(&self, rel: &Path) -> bool {
        match self.visibility {
            Visibility::ExceptTests => true,
            Visibility::TestsOnly => rel.starts_with(&self.tests_dir),
        }
    }

    /// Rebuild the copy from the current workspace and return its root.
    pub fn materialize(&self) -> Result<PathBuf> {
        if self.dest.exists() {
            fs::remove_dir_all(&self.dest)
                .with_context(|| format!("remove stale view {}", self.dest.display()))?;
        }
        fs::create_dir_all(&self.dest).with_context(|| format!("create view {}", self.dest.display()))?;

        let mut copied = 0usize;
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.root)
                    .is_ok_and(|rel| rel.as_os_str().is_empty() || self.descend(rel))
            });
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", self.root.display()))?;
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            if rel.as_os_str().is_empty() || !entry.file_type().is_file() || !self.copies(rel) {
                continue;
            }
            let target = self.dest.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
            }
            fs::copy(entry.path(), &target).with_context(|| format!("copy {}", rel.display()))?;
            copied += 1;
        }
        debug!(view = %self.dest.display(), visibility = ?self.visibility, copied, "workspace view ready");
        Ok(self.dest.clone())
    }
}
