#![allow(dead_code)]

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use relay::backend::{Generator, Request, SpecRequest};
use relay::clock::ManualClock;
use relay::git::Git;
use relay::store::memory::MemoryStore;
use relay::subprocess::Tool;

pub fn start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub fn store() -> (MemoryStore, ManualClock) {
    let clock = ManualClock::new(start());
    (MemoryStore::new(clock.clone()), clock)
}

/// A bare git remote seeded with one commit on `main`.
pub struct Remote {
    pub dir: tempfile::TempDir,
    pub url: String,
}

impl Remote {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let seed = dir.path().join("seed");
        let git = |cwd: &Path, args: &[&str]| {
            Tool::new("git")
                .current_dir(cwd)
                .args(&["-c", "user.name=t", "-c", "user.email=t@example.com"])
                .args(args)
                .run_ok()
                .unwrap();
        };
        git(dir.path(), &["init", "-q", "--bare", "-b", "main", "remote.git"]);
        git(dir.path(), &["clone", "-q", "remote.git", "seed"]);
        std::fs::write(seed.join("README.md"), "seed\n").unwrap();
        git(&seed, &["add", "-A"]);
        git(&seed, &["commit", "-q", "-m", "seed"]);
        git(&seed, &["push", "-q", "origin", "HEAD:main"]);
        let url = dir.path().join("remote.git").to_string_lossy().into_owned();
        Self { dir, url }
    }

    pub fn work_dir(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    pub fn file_on_branch(&self, branch: &str, path: &str) -> Option<String> {
        let out = Tool::new("git")
            .args(&["--git-dir", &self.url, "show"])
            .arg(&format!("{branch}:{path}"))
            .run()
            .ok()?;
        out.success().then_some(out.stdout)
    }
}

pub fn git() -> Git {
    Git::new("git").with_author("Relay Test", "relay@example.com")
}

/// Fixed replies per request kind; edit requests also write `files` into the worktree.
#[derive(Default)]
pub struct FakeBackend {
    pub spec: String,
    pub spec_review: String,
    pub test_files: Vec<(String, String)>,
    pub impl_files: Vec<(String, String)>,
    pub review: String,
    pub calls: RefCell<Vec<&'static str>>,
}

impl FakeBackend {
    fn write(dir: &Path, files: &[(String, String)]) -> anyhow::Result<()> {
        for (path, contents) in files {
            let full = dir.join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(full, contents)?;
        }
        Ok(())
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.borrow().iter().filter(|c| **c == call).count()
    }
}

impl Generator for FakeBackend {
    fn create_spec(&self, _request: &SpecRequest<'_>) -> anyhow::Result<String> {
        self.calls.borrow_mut().push("create_spec");
        Ok(self.spec.clone())
    }

    fn review_spec(&self, _spec: &str) -> anyhow::Result<String> {
        self.calls.borrow_mut().push("review_spec");
        Ok(self.spec_review.clone())
    }

    fn generate_tests(&self, request: &Request<'_>) -> anyhow::Result<String> {
        self.calls.borrow_mut().push("generate_tests");
        Self::write(request.work_dir, &self.test_files)?;
        Ok(String::new())
    }

    fn generate_implementation(&self, request: &Request<'_>) -> anyhow::Result<String> {
        self.calls.borrow_mut().push("generate_implementation");
        Self::write(request.work_dir, &self.impl_files)?;
        Ok(String::new())
    }

    fn review_change(&self, _spec: &str, _diff: &str) -> anyhow::Result<String> {
        self.calls.borrow_mut().push("review_change");
        Ok(self.review.clone())
    }
}
