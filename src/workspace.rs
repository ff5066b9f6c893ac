//! Per-task linked worktrees cut from one mirror per agent process.
//!
//! The mirror lives at `<work_dir>/mirrors/<owner>_<repo>__<agent-id>` and is
//! never shared between processes. Before every checkout it is forced back to
//! the base branch, so a previous task can never leak into the next one.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::{debug, info, warn};

use crate::git::Git;

/// What the new worktree should have checked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchSpec {
    /// Create (or reset) `branch` at `origin/<base>`.
    New { branch: String, base: String },
    /// Track the existing remote `origin/<branch>`.
    Existing { branch: String, base: String },
}

impl BranchSpec {
    pub fn branch(&self) -> &str {
        match self {
            Self::New { branch, .. } | Self::Existing { branch, .. } => branch,
        }
    }

    pub fn base(&self) -> &str {
        match self {
            Self::New { base, .. } | Self::Existing { base, .. } => base,
        }
    }

    fn start_point(&self) -> String {
        match self {
            Self::New { base, .. } => format!("origin/{base}"),
            Self::Existing { branch, .. } => format!("origin/{branch}"),
        }
    }
}

pub struct WorkspaceManager {
    git: Git,
    url: String,
    mirror: PathBuf,
}

impl WorkspaceManager {
    pub fn new(git: Git, url: &str, work_dir: &Path, repo: &str, agent_id: &str) -> Self {
        Self {
            git,
            url: url.to_string(),
            mirror: mirror_path(work_dir, repo, agent_id),
        }
    }

    pub fn mirror(&self) -> &Path {
        &self.mirror
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    fn worktrees_root(&self) -> PathBuf {
        let mut name = self
            .mirror
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push("_worktrees");
        self.mirror.with_file_name(name)
    }

    /// Clone the mirror on first use, otherwise fetch.
    pub fn ensure_mirror(&self) -> Result<()> {
        if self.mirror.join(".git").exists() {
            self.git.fetch(&self.mirror)
        } else {
            info!(mirror = %self.mirror.display(), "cloning mirror");
            self.git
                .clone_mirror(&self.url, &self.mirror)
                .context("cloning mirror")
        }
    }

    /// Force the mirror onto `origin/<base>` with a clean tree.
    pub fn sync(&self, base: &str) -> Result<()> {
        let remote = format!("origin/{base}");
        self.git.fetch(&self.mirror)?;
        self.git.checkout_tracking(&self.mirror, base, &remote)?;
        self.git.reset_hard(&self.mirror, &remote)?;
        self.git.clean(&self.mirror)?;
        debug!(base, "mirror synced");
        Ok(())
    }

    /// Create an isolated worktree for `task`. The returned guard removes it.
    pub fn checkout(&self, task: &str, spec: &BranchSpec, now: DateTime<Utc>) -> Result<Worktree> {
        self.ensure_mirror()?;
        self.sync(spec.base())
            .with_context(|| format!("syncing mirror to {}", spec.base()))?;

        let root = self.worktrees_root();
        std::fs::create_dir_all(&root).with_context(|| format!("creating {}", root.display()))?;
        let path = root.join(unique_name(task, now));
        let start = spec.start_point();

        if let Err(first) = self.git.worktree_add(&self.mirror, spec.branch(), &path, &start) {
            warn!(task, "worktree add failed, pruning and retrying: {first:#}");
            self.git.worktree_prune(&self.mirror)?;
            self.git
                .worktree_add(&self.mirror, spec.branch(), &path, &start)
                .with_context(|| format!("creating worktree for {task} after prune"))?;
        }

        info!(task, branch = spec.branch(), path = %path.display(), "worktree ready");
        Ok(Worktree {
            git: self.git.clone(),
            mirror: self.mirror.clone(),
            path,
            branch: spec.branch().to_string(),
            released: false,
        })
    }
}

/// A checked-out linked worktree. Removed on [`Worktree::release`] or drop.
#[derive(Debug)]
pub struct Worktree {
    git: Git,
    mirror: PathBuf,
    path: PathBuf,
    branch: String,
    released: bool,
}

impl Worktree {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Remove the worktree and prune its metadata. Safe to call more than once.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let removed = self.git.worktree_remove(&self.mirror, &self.path);
        if self.path.exists() {
            std::fs::remove_dir_all(&self.path)
                .with_context(|| format!("removing {}", self.path.display()))?;
        }
        self.git.worktree_prune(&self.mirror)?;
        removed
    }
}

impl Drop for Worktree {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(path = %self.path.display(), "worktree cleanup failed: {e:#}");
        }
    }
}

/// `<work_dir>/mirrors/<owner>_<repo>__<agent-id>`
pub fn mirror_path(work_dir: &Path, repo: &str, agent_id: &str) -> PathBuf {
    work_dir
        .join("mirrors")
        .join(format!("{}__{agent_id}", repo.replace('/', "_")))
}

fn unique_name(task: &str, now: DateTime<Utc>) -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(6)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{task}-{}-{suffix}", now.format("%Y%m%d_%H%M%S%6f"))
}
