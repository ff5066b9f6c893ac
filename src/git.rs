//! Thin wrapper over the `git` CLI.
//!
//! Every call runs `git -C <dir> ...` through [`Tool`], so failures carry the
//! command's combined output. Commit identity is passed per call with
//! `-c user.name=... -c user.email=...` rather than written into any config.

use std::path::Path;

use anyhow::{Context, Result};

use crate::subprocess::{RunOutput, Tool};

/// Result of an attempt to commit a working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A commit was created.
    Committed { sha: String },
    /// Nothing to commit. Distinct from failure.
    NoOp,
    Failed { output: String },
}

/// Classify the output of `git commit`.
///
/// "No changes to commit" / "nothing to commit" (any case) is a no-op even
/// when the command exited non-zero.
pub fn classify_commit(output: &RunOutput) -> CommitOutcome {
    let text = output.combined();
    let lower = text.to_lowercase();
    if lower.contains("no changes to commit") || lower.contains("nothing to commit") {
        return CommitOutcome::NoOp;
    }
    if output.success() {
        CommitOutcome::Committed { sha: String::new() }
    } else {
        CommitOutcome::Failed { output: text }
    }
}

#[derive(Debug, Clone)]
pub struct Git {
    program: String,
    author: Option<(String, String)>,
}

impl Git {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            author: None,
        }
    }

    /// Commit as `name <email>` instead of the ambient git identity.
    #[must_use]
    pub fn with_author(mut self, name: &str, email: &str) -> Self {
        self.author = Some((name.to_string(), email.to_string()));
        self
    }

    fn tool(&self, dir: &Path, args: &[&str]) -> Tool {
        let mut tool = Tool::new(&self.program).arg("-C").arg(&dir.to_string_lossy());
        if let Some((name, email)) = &self.author {
            tool = tool
                .arg("-c")
                .arg(&format!("user.name={name}"))
                .arg("-c")
                .arg(&format!("user.email={email}"));
        }
        tool.args(args)
    }

    /// Run and require success.
    fn run(&self, dir: &Path, args: &[&str]) -> Result<RunOutput> {
        let out = self.tool(dir, args).run()?;
        if !out.success() {
            anyhow::bail!(
                "git {} failed in {}: {}",
                args.join(" "),
                dir.display(),
                out.combined()
            );
        }
        Ok(out)
    }

    pub fn clone_mirror(&self, url: &str, dest: &Path) -> Result<()> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        let name = dest
            .file_name()
            .with_context(|| format!("clone destination {} has no name", dest.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
        self.run(parent, &["clone", "--quiet", url, &name.to_string_lossy()])?;
        Ok(())
    }

    pub fn fetch(&self, repo: &Path) -> Result<()> {
        self.run(repo, &["fetch", "--prune", "origin"])?;
        Ok(())
    }

    /// Point `branch` at `start` and check it out, creating it if needed.
    pub fn checkout_tracking(&self, repo: &Path, branch: &str, start: &str) -> Result<()> {
        self.run(repo, &["checkout", "-B", branch, start])?;
        Ok(())
    }

    pub fn reset_hard(&self, repo: &Path, target: &str) -> Result<()> {
        self.run(repo, &["reset", "--hard", target])?;
        Ok(())
    }

    pub fn clean(&self, repo: &Path) -> Result<()> {
        self.run(repo, &["clean", "-fd"])?;
        Ok(())
    }

    pub fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        self.run(repo, &["branch", "-D", branch])?;
        Ok(())
    }

    pub fn remote_branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let out = self
            .tool(repo, &["rev-parse", "--verify", "--quiet", &format!("refs/remotes/origin/{branch}")])
            .run()?;
        Ok(out.success())
    }

    pub fn is_dirty(&self, dir: &Path) -> Result<bool> {
        let out = self.run(dir, &["status", "--porcelain"])?;
        Ok(!out.stdout.trim().is_empty())
    }

    /// Paths with uncommitted changes (untracked included) under `pathspec`.
    pub fn changed_files(&self, dir: &Path, pathspec: &str) -> Result<Vec<String>> {
        let out = self.run(
            dir,
            &["status", "--porcelain", "--untracked-files=all", "--", pathspec],
        )?;
        Ok(out.stdout.lines().filter_map(porcelain_path).collect())
    }

    /// Stage everything and commit if the tree is dirty.
    pub fn commit_all(&self, dir: &Path, message: &str) -> Result<CommitOutcome> {
        self.run(dir, &["add", "-A"])?;
        if !self.is_dirty(dir)? {
            return Ok(CommitOutcome::NoOp);
        }
        let out = self.tool(dir, &["commit", "-m", message]).run()?;
        match classify_commit(&out) {
            CommitOutcome::Committed { .. } => Ok(CommitOutcome::Committed {
                sha: self.head(dir)?,
            }),
            other => Ok(other),
        }
    }

    pub fn head(&self, dir: &Path) -> Result<String> {
        let out = self.run(dir, &["rev-parse", "HEAD"])?;
        Ok(out.stdout.trim().to_string())
    }

    /// Push `branch` to origin, overwriting only what this process last saw there.
    pub fn push(&self, dir: &Path, branch: &str) -> Result<()> {
        self.run(dir, &["push", "--force-with-lease", "-u", "origin", branch])?;
        Ok(())
    }

    pub fn worktree_add(&self, repo: &Path, branch: &str, path: &Path, start: &str) -> Result<()> {
        self.run(
            repo,
            &["worktree", "add", "-B", branch, &path.to_string_lossy(), start],
        )?;
        Ok(())
    }

    pub fn worktree_remove(&self, repo: &Path, path: &Path) -> Result<()> {
        self.run(repo, &["worktree", "remove", "--force", &path.to_string_lossy()])?;
        Ok(())
    }

    pub fn worktree_prune(&self, repo: &Path) -> Result<()> {
        self.run(repo, &["worktree", "prune"])?;
        Ok(())
    }
}

/// Path part of a `git status --porcelain` line; renames yield the new path.
fn porcelain_path(line: &str) -> Option<String> {
    let path = line.get(3..)?.trim();
    if path.is_empty() {
        return None;
    }
    let path = path.rsplit_once(" -> ").map_or(path, |(_, to)| to);
    Some(path.trim_matches('"').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(code: i32, stdout: &str, stderr: &str) -> RunOutput {
        RunOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: code,
        }
    }

    fn repo() -> (tempfile::TempDir, Git) {
        let dir = tempfile::tempdir().unwrap();
        let git = Git::new("git").with_author("Relay Test", "relay@example.com");
        git.run(dir.path(), &["init", "-q", "-b", "main"]).unwrap();
        std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        assert!(matches!(
            git.commit_all(dir.path(), "init").unwrap(),
            CommitOutcome::Committed { .. }
        ));
        (dir, git)
    }

    #[test]
    fn no_changes_output_is_noop_regardless_of_case() {
        assert_eq!(classify_commit(&out(1, "No changes to commit", "")), CommitOutcome::NoOp);
        assert_eq!(
            classify_commit(&out(1, "On branch main\nnothing to commit, working tree clean", "")),
            CommitOutcome::NoOp
        );
        assert_eq!(classify_commit(&out(0, "NO CHANGES TO COMMIT", "")), CommitOutcome::NoOp);
    }

    #[test]
    fn other_failures_are_failed_not_noop() {
        let outcome = classify_commit(&out(128, "", "fatal: unable to auto-detect email address"));
        assert!(matches!(outcome, CommitOutcome::Failed { ref output } if output.contains("fatal")));
    }

    #[test]
    fn clean_tree_commit_is_noop() {
        let (dir, git) = repo();
        assert_eq!(git.commit_all(dir.path(), "again").unwrap(), CommitOutcome::NoOp);
    }

    #[test]
    fn dirty_tree_commit_returns_new_head() {
        let (dir, git) = repo();
        let before = git.head(dir.path()).unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn main() {}\n").unwrap();

        let outcome = git.commit_all(dir.path(), "add lib").unwrap();

        let CommitOutcome::Committed { sha } = outcome else {
            panic!("expected commit, got {outcome:?}");
        };
        assert_ne!(sha, before);
        assert!(!git.is_dirty(dir.path()).unwrap());
    }

    #[test]
    fn changed_files_is_scoped_to_pathspec() {
        let (dir, git) = repo();
        std::fs::create_dir_all(dir.path().join("tests/unit")).unwrap();
        std::fs::write(dir.path().join("tests/unit/a_test.rs"), "").unwrap();
        std::fs::write(dir.path().join("tests/b_test.rs"), "").unwrap();
        std::fs::write(dir.path().join("src.rs"), "").unwrap();

        let mut files = git.changed_files(dir.path(), "tests").unwrap();
        files.sort();
        assert_eq!(files, vec!["tests/b_test.rs", "tests/unit/a_test.rs"]);
    }

    #[test]
    fn porcelain_paths_handle_renames() {
        assert_eq!(porcelain_path("?? tests/new.rs"), Some("tests/new.rs".into()));
        assert_eq!(porcelain_path("R  old.rs -> tests/new.rs"), Some("tests/new.rs".into()));
        assert_eq!(porcelain_path(""), None);
    }
}
