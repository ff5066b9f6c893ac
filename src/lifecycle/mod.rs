//! The per-role state machines that move items through their `status:` labels.
//!
//! Each role is a [`RoleAgent`] whose `run_cycle` does one pass: sweep stale
//! locks for the statuses the role holds, then try every eligible item in
//! order. Contention and per-item failures are absorbed inside the cycle;
//! only errors that make the whole pass meaningless (listing failed) escape.

pub mod ci;
pub mod planner;
pub mod reviewer;
pub mod verify;
pub mod worker;

use std::fmt;

use tracing::{debug, warn};

use crate::backend::Generator;
use crate::clock::Clock;
use crate::config::Config;
use crate::identity::{AgentId, Role};
use crate::lock::stale::{Recovery, StaleLockDetector};
use crate::lock::{LockCoordinator, LockError};
use crate::markers;
use crate::status::Status;
use crate::store::{RemoteStore, StoreError};

/// Borrowed collaborators shared by every role.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub store: &'a dyn RemoteStore,
    pub clock: &'a dyn Clock,
    pub generator: &'a dyn Generator,
    pub config: &'a Config,
    pub agent: &'a AgentId,
}

impl<'a> Services<'a> {
    pub fn lock(&self) -> LockCoordinator<'a> {
        LockCoordinator::new(self.store, self.clock, self.agent, &self.config.lock)
    }

    /// Force-unlock this role's stale in-progress items.
    pub fn sweep_stale(&self) -> Result<Vec<Recovery>, StoreError> {
        StaleLockDetector::new(
            self.store,
            self.clock,
            self.agent.role(),
            self.config.lock.stale_timeout(),
        )
        .sweep(self.agent.role().held_statuses())
    }

    /// Post a comment whose loss should not abort the transaction.
    pub fn note(&self, item: u64, body: &str) {
        if let Err(e) = self.store.post_comment(item, body) {
            warn!(item, "comment not posted: {e}");
        }
    }

    /// Hand an item back with an `ESCALATION:<role>` comment and move it to `escalated`.
    pub fn escalate(&self, item: u64, from: Status, reason: &str, details: &str) -> anyhow::Result<()> {
        let body = markers::escalation(self.agent.role().as_str(), reason, details);
        self.store.post_comment(item, &body)?;
        self.lock().transition(item, from, Status::Escalated)?;
        warn!(item, reason, "escalated");
        Ok(())
    }

    /// Fail the ticket a failed change was opened for, so the spec-writer
    /// sees it. Tickets that already left review are left alone.
    pub fn fail_linked_ticket(&self, change: u64, ticket: u64, error: &anyhow::Error) {
        match self.store.get_item(ticket) {
            Ok(item) if item.has_status(Status::Reviewing) => {
                let error = anyhow::anyhow!("change #{change} failed: {error:#}");
                self.fail(ticket, Status::Reviewing, &error);
            }
            Ok(_) => debug!(ticket, "linked ticket not in review; leaving it"),
            Err(e) => warn!(ticket, "could not read linked ticket: {e}"),
        }
    }

    /// Record a transaction error on the item. Never fails.
    pub fn fail(&self, item: u64, from: Status, error: &anyhow::Error) {
        if let Err(e) = self.lock().mark_failed(item, from, &format!("{error:#}")) {
            warn!(item, "could not mark failed: {e}");
        }
    }
}

/// How one item's transaction ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Moved on to the given status.
    Completed(Status),
    /// Nothing to change; returned to where it came from.
    NoOp,
    Escalated,
    CiFailed,
    Failed,
    /// Lock not taken or item not eligible.
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(status) => write!(f, "completed ({status})"),
            Self::NoOp => f.write_str("no-op"),
            Self::Escalated => f.write_str("escalated"),
            Self::CiFailed => f.write_str("ci-failed"),
            Self::Failed => f.write_str("failed"),
            Self::Skipped => f.write_str("skipped"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub recovered: Vec<Recovery>,
    pub outcomes: Vec<(u64, Outcome)>,
}

impl CycleReport {
    pub fn record(&mut self, item: u64, outcome: Outcome) {
        self.outcomes.push((item, outcome));
    }

    /// Items that were actually worked on, not skipped.
    pub fn handled(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o != Outcome::Skipped)
            .count()
    }

    pub fn outcome(&self, item: u64) -> Option<&Outcome> {
        self.outcomes.iter().rev().find(|(n, _)| *n == item).map(|(_, o)| o)
    }
}

/// One role's polling behaviour.
pub trait RoleAgent {
    fn role(&self) -> Role;
    fn run_cycle(&mut self) -> anyhow::Result<CycleReport>;
}

/// Log a failed acquisition at the level its kind deserves.
pub(crate) fn log_lock_miss(item: u64, err: &LockError) {
    if err.is_contention() {
        debug!(item, "skipping: {err}");
    } else {
        warn!(item, "lock not acquired: {err}");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted backend shared by the role tests.

    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};

    use crate::backend::{Generator, Request, SpecRequest};
    use crate::git::Git;
    use crate::subprocess::Tool;

    /// A bare remote with one commit on `main`, plus a scratch work dir.
    pub struct Remote {
        pub dir: tempfile::TempDir,
        pub url: String,
    }

    impl Remote {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let seed = dir.path().join("seed");
            let run = |cwd: &Path, args: &[&str]| {
                Tool::new("git")
                    .current_dir(cwd)
                    .args(&["-c", "user.name=t", "-c", "user.email=t@example.com"])
                    .args(args)
                    .run_ok()
                    .unwrap();
            };
            run(dir.path(), &["init", "-q", "--bare", "-b", "main", "remote.git"]);
            run(dir.path(), &["clone", "-q", "remote.git", "seed"]);
            std::fs::write(seed.join("README.md"), "seed\n").unwrap();
            run(&seed, &["add", "-A"]);
            run(&seed, &["commit", "-q", "-m", "seed"]);
            run(&seed, &["push", "-q", "origin", "HEAD:main"]);
            let url = dir.path().join("remote.git").to_string_lossy().into_owned();
            Self { dir, url }
        }

        pub fn work_dir(&self) -> PathBuf {
            self.dir.path().join("work")
        }

        /// Whether `branch` exists on the remote.
        pub fn has_branch(&self, branch: &str) -> bool {
            Tool::new("git")
                .args(&["--git-dir", &self.url, "rev-parse", "--verify", "--quiet"])
                .arg(&format!("refs/heads/{branch}"))
                .run()
                .is_ok_and(|o| o.success())
        }
    }

    pub fn git() -> Git {
        Git::new("git").with_author("Relay Test", "relay@example.com")
    }

    /// What a scripted call does: touch files in the worktree, then reply.
    #[derive(Debug, Clone, Default)]
    pub struct Step {
        pub files: Vec<(String, String)>,
        pub remove: Vec<String>,
        pub reply: String,
        pub fail: bool,
    }

    impl Step {
        pub fn reply(text: &str) -> Self {
            Self {
                reply: text.to_string(),
                ..Self::default()
            }
        }

        pub fn write(path: &str, contents: &str) -> Self {
            Self {
                files: vec![(path.to_string(), contents.to_string())],
                ..Self::default()
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }
    }

    #[derive(Default)]
    pub struct ScriptedGenerator {
        pub specs: RefCell<VecDeque<Step>>,
        pub spec_reviews: RefCell<VecDeque<Step>>,
        pub tests: RefCell<VecDeque<Step>>,
        pub implementations: RefCell<VecDeque<Step>>,
        pub reviews: RefCell<VecDeque<Step>>,
        pub calls: RefCell<Vec<&'static str>>,
        pub feedback_seen: RefCell<Vec<Option<String>>>,
    }

    impl ScriptedGenerator {
        pub fn count(&self, call: &str) -> usize {
            self.calls.borrow().iter().filter(|c| **c == call).count()
        }

        fn play(&self, call: &'static str, queue: &RefCell<VecDeque<Step>>, dir: Option<&Path>) -> anyhow::Result<String> {
            self.calls.borrow_mut().push(call);
            // The last step repeats once the script runs out.
            let step = {
                let mut q = queue.borrow_mut();
                if q.len() > 1 { q.pop_front() } else { q.front().cloned() }
            }
            .unwrap_or_default();
            if step.fail {
                anyhow::bail!("{call} backend failed");
            }
            if let Some(dir) = dir {
                for (path, contents) in &step.files {
                    let full = dir.join(path);
                    if let Some(parent) = full.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(full, contents)?;
                }
                for path in &step.remove {
                    std::fs::remove_file(dir.join(path))?;
                }
            }
            Ok(step.reply)
        }
    }

    impl Generator for ScriptedGenerator {
        fn create_spec(&self, request: &SpecRequest<'_>) -> anyhow::Result<String> {
            self.feedback_seen.borrow_mut().push(request.feedback.map(str::to_string));
            self.play("create_spec", &self.specs, None)
        }

        fn review_spec(&self, _spec: &str) -> anyhow::Result<String> {
            self.play("review_spec", &self.spec_reviews, None)
        }

        fn generate_tests(&self, request: &Request<'_>) -> anyhow::Result<String> {
            self.feedback_seen.borrow_mut().push(request.feedback.map(str::to_string));
            self.play("generate_tests", &self.tests, Some(request.work_dir))
        }

        fn generate_implementation(&self, request: &Request<'_>) -> anyhow::Result<String> {
            self.play("generate_implementation", &self.implementations, Some(request.work_dir))
        }

        fn review_change(&self, _spec: &str, _diff: &str) -> anyhow::Result<String> {
            self.play("review_change", &self.reviews, None)
        }
    }
}
