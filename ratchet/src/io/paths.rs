//! Layout of the `.ratchet/` directory and its initialization.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{RatchetConfig, write_config};
use crate::core::ids::RunId;

/// Canonical paths within `.ratchet/` for a workspace root.
#[derive(Debug, Clone)]
pub struct RatchetPaths {
    pub root: PathBuf,
    pub ratchet_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub runs_dir: PathBuf,
}

impl RatchetPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let ratchet_dir = root.join(".ratchet");
        Self {
            root: root.clone(),
            gitignore_path: ratchet_dir.join(".gitignore"),
            config_path: ratchet_dir.join("config.toml"),
            checkpoints_dir: ratchet_dir.join("checkpoints"),
            runs_dir: ratchet_dir.join("runs"),
            ratchet_dir,
        }
    }

    /// Scratch directory for one run's agent inputs and outputs.
    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir.join(run_id.as_str())
    }
}

/// Create `.ratchet/` scaffolding in `root`.
///
/// Fails if `.ratchet/` already exists unless `force` is set. Existing
/// checkpoints survive a forced init; only the config is rewritten.
pub fn init_workspace(root: &Path, force: bool) -> Result<RatchetPaths> {
    let paths = RatchetPaths::new(root);
    if paths.ratchet_dir.exists() && !paths.ratchet_dir.is_dir() {
        return Err(anyhow!("ratchet init: .ratchet exists but is not a directory"));
    }
    if paths.ratchet_dir.exists() && !force {
        return Err(anyhow!(
            "ratchet init: .ratchet already exists (use --force to overwrite)"
        ));
    }

    for dir in [&paths.ratchet_dir, &paths.checkpoints_dir, &paths.runs_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    fs::write(&paths.gitignore_path, RATCHET_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &RatchetConfig::default())?;
    Ok(paths)
}

/// Everything under `.ratchet/` stays out of the workspace's commits, so
/// rewinding to a mark never touches checkpoints.
const RATCHET_GITIGNORE: &str = "*\n";
