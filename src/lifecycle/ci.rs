//! Bounded build-status polling and the CI fix loop for a pushed change.

use std::fmt::Write as _;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use super::Services;
use super::verify::tail;
use crate::backend::Request;
use crate::clock::to_delta;
use crate::git::CommitOutcome;
use crate::status::Status;
use crate::store::{BuildState, CheckFailure, Item};
use crate::workspace::Worktree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildWait {
    Green,
    Red,
    /// Still pending at the deadline. Not a failure.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiOutcome {
    Green,
    TimedOut,
    /// Out of fix attempts; the change is now `ci-failed`.
    GaveUp,
}

/// Poll `change` until its build settles or the configured wait runs out.
pub fn wait_for_build(s: &Services<'_>, change: u64) -> anyhow::Result<BuildWait> {
    let lifecycle = &s.config.lifecycle;
    let interval = Duration::from_secs(lifecycle.ci_poll_interval_secs);
    let deadline = s.clock.now() + to_delta(Duration::from_secs(lifecycle.ci_wait_timeout_secs));
    loop {
        let status = s
            .store
            .build_status(change)
            .with_context(|| format!("reading build status of #{change}"))?;
        match status.state {
            BuildState::Success | BuildState::None => return Ok(BuildWait::Green),
            BuildState::Failure => return Ok(BuildWait::Red),
            BuildState::Pending => {
                debug!(change, pending = status.pending, "build pending");
            }
        }
        if s.clock.now() >= deadline {
            info!(change, "build still pending at deadline; leaving it");
            return Ok(BuildWait::TimedOut);
        }
        s.clock.sleep(interval);
    }
}

/// Wait for the build and, while it is red, ask the backend for fixes.
///
/// At most `max_ci_retries` fixes are pushed. After that the change moves
/// `reviewing -> ci-failed` with a comment and is left for a human.
pub fn watch_and_fix(s: &Services<'_>, change: u64, ticket: &Item, wt: &Worktree) -> anyhow::Result<CiOutcome> {
    let max = s.config.lifecycle.max_ci_retries;
    let mut fixes = 0;
    loop {
        match wait_for_build(s, change)? {
            BuildWait::Green => return Ok(CiOutcome::Green),
            BuildWait::TimedOut => return Ok(CiOutcome::TimedOut),
            BuildWait::Red => {}
        }

        let failures = s.store.failed_checks(change).unwrap_or_else(|e| {
            warn!(change, "could not fetch failed checks: {e}");
            Vec::new()
        });
        let report = failure_report(&failures);

        if fixes >= max {
            s.lock().transition(change, Status::Reviewing, Status::CiFailed)?;
            s.note(
                change,
                &format!("**CI still failing after {max} fix attempts.** Needs a human.\n\n{report}"),
            );
            warn!(change, "giving up on CI");
            return Ok(CiOutcome::GaveUp);
        }
        fixes += 1;
        info!(change, attempt = fixes, "build failed; requesting fix");

        let feedback = format!("The CI build failed after your change was pushed.\n\n{report}");
        s.generator.generate_implementation(&Request {
            number: ticket.number,
            title: &ticket.title,
            spec: &ticket.body,
            feedback: Some(&feedback),
            test_dir: &s.config.lifecycle.test_dir,
            work_dir: wt.path(),
        })?;

        let message = format!("Fix CI for #{} (attempt {fixes})", ticket.number);
        match wt.git().commit_all(wt.path(), &message)? {
            CommitOutcome::Committed { .. } => {
                wt.git().push(wt.path(), wt.branch())?;
                s.note(change, &format!("Pushed CI fix attempt {fixes}/{max}."));
            }
            CommitOutcome::NoOp => {
                s.note(change, &format!("CI fix attempt {fixes}/{max} produced no changes."));
            }
            CommitOutcome::Failed { output } => anyhow::bail!("commit of CI fix failed: {output}"),
        }
    }
}

/// Markdown summary of failed checks for comments and backend feedback.
pub fn failure_report(failures: &[CheckFailure]) -> String {
    if failures.is_empty() {
        return "No failed check details were available.".to_string();
    }
    let mut out = String::from("### Failed checks\n");
    for f in failures {
        let _ = write!(out, "\n- **{}** ({})", f.name, f.conclusion);
        if let Some(url) = &f.url {
            let _ = write!(out, " {url}");
        }
        if let Some(title) = f.title.as_deref().filter(|t| !t.is_empty()) {
            let _ = write!(out, "\n  {title}");
        }
        if let Some(summary) = f.summary.as_deref().filter(|t| !t.is_empty()) {
            let _ = write!(out, "\n\n```\n{}\n```", tail(summary, 2_000));
        }
    }
    out
}
