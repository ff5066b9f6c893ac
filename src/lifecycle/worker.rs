//! Implementer: `ready` tickets become pushed change proposals, and
//! `changes-requested` proposals get reworked.
//!
//! Tests are generated before any implementation. A ticket whose spec yields
//! no test files is escalated back to the spec-writer without ever asking for
//! code.

use anyhow::Context;
use tracing::{info, info_span, instrument, warn};

use super::ci::{self, CiOutcome};
use super::verify::{self, Verification};
use super::{CycleReport, Outcome, RoleAgent, Services, log_lock_miss};
use crate::backend::Request;
use crate::git::CommitOutcome;
use crate::identity::Role;
use crate::lock::ClaimToken;
use crate::markers::{self, RetryKind};
use crate::status::Status;
use crate::store::{Item, ItemKind, NewChange};
use crate::workspace::{BranchSpec, WorkspaceManager, Worktree};

const TEST_DESIGN: &str = "test design";

pub struct Implementer<'a> {
    s: Services<'a>,
    workspace: &'a WorkspaceManager,
}

/// Result of the generate/verify loop.
enum Build {
    Passed,
    /// Retry bound exceeded; carries the last failure.
    Exhausted(String),
}

impl<'a> Implementer<'a> {
    pub const fn new(services: Services<'a>, workspace: &'a WorkspaceManager) -> Self {
        Self {
            s: services,
            workspace,
        }
    }

    fn base_branch(&self) -> anyhow::Result<String> {
        match &self.s.config.git.base_branch {
            Some(base) => Ok(base.clone()),
            None => Ok(self.s.store.default_branch()?),
        }
    }

    /// Claim a `ready` ticket and carry it through to an open change proposal.
    #[instrument(skip_all, fields(item = ticket.number))]
    pub fn process_ticket(&self, ticket: &Item) -> Outcome {
        let token = match self.s.lock().acquire(ticket.number, Status::Ready, Status::Implementing) {
            Ok(token) => token,
            Err(e) => {
                log_lock_miss(ticket.number, &e);
                return Outcome::Skipped;
            }
        };
        info!(title = %ticket.title, "implementing");
        match self.implement_ticket(ticket, &token) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("implementation failed: {e:#}");
                self.s.fail(ticket.number, Status::Implementing, &e);
                Outcome::Failed
            }
        }
    }

    fn implement_ticket(&self, ticket: &Item, token: &ClaimToken) -> anyhow::Result<Outcome> {
        let n = ticket.number;
        let base = self.base_branch()?;
        let branch = format!("auto/issue-{n}");
        let wt = self
            .workspace
            .checkout(
                &format!("issue-{n}"),
                &BranchSpec::New {
                    branch: branch.clone(),
                    base: base.clone(),
                },
                self.s.clock.now(),
            )
            .context("creating workspace")?;

        let request = Request {
            number: n,
            title: &ticket.title,
            spec: &ticket.body,
            feedback: None,
            test_dir: &self.s.config.lifecycle.test_dir,
            work_dir: wt.path(),
        };

        self.s.generator.generate_tests(&request).context("generating tests")?;
        let tests = wt.git().changed_files(wt.path(), request.test_dir)?;
        if tests.is_empty() {
            self.s.escalate(
                n,
                Status::Implementing,
                &format!("{TEST_DESIGN}: test generation produced no test files"),
                &format!(
                    "No files appeared under `{}/`. The specification may be too vague to test.",
                    request.test_dir
                ),
            )?;
            return Ok(Outcome::Escalated);
        }
        info!(count = tests.len(), "tests generated");

        if let Build::Exhausted(last) = self.build(n, &request, token)? {
            self.s.escalate(
                n,
                Status::Implementing,
                &format!(
                    "{TEST_DESIGN}: local verification still failing after {} retries",
                    self.s.config.lifecycle.max_local_retries
                ),
                &last,
            )?;
            return Ok(Outcome::Escalated);
        }

        match wt
            .git()
            .commit_all(wt.path(), &format!("Implement #{n}: {}", ticket.title))?
        {
            CommitOutcome::Committed { .. } => {}
            CommitOutcome::NoOp => {
                self.s.note(
                    n,
                    &format!(
                        "No changes to commit: generation left the tree unchanged. Returning to `{}`.",
                        Status::Ready
                    ),
                );
                self.s.lock().transition(n, Status::Implementing, Status::Ready)?;
                return Ok(Outcome::NoOp);
            }
            CommitOutcome::Failed { output } => anyhow::bail!("commit failed: {output}"),
        }
        wt.git().push(wt.path(), &branch).context("pushing branch")?;

        let labels = [Status::Reviewing.label()];
        let change = self.s.store.open_change(&NewChange {
            title: &format!("[auto] {}", ticket.title),
            body: &format!("Closes #{n}\n\nImplemented by `{}`.", self.s.agent),
            head: &branch,
            base: &base,
            labels: &labels,
        })?;
        self.s.lock().transition(n, Status::Implementing, Status::Reviewing)?;
        self.s.note(n, &format!("Opened #{change} for review."));
        info!(change, "change proposal opened");

        Ok(self.settle_ci(change, ticket, &wt))
    }

    /// Generate an implementation and verify it, revising tests and code on
    /// failure until it passes or the local retry bound is exceeded.
    fn build(&self, marker_item: u64, base: &Request<'_>, token: &ClaimToken) -> anyhow::Result<Build> {
        let max = self.s.config.lifecycle.max_local_retries;
        let mut feedback: Option<String> = base.feedback.map(str::to_string);
        let mut attempts = 0;
        loop {
            let request = Request {
                feedback: feedback.as_deref(),
                ..*base
            };
            self.s
                .generator
                .generate_implementation(&request)
                .context("generating implementation")?;

            let verification = verify::run(base.work_dir, &self.s.config.lifecycle)?;
            let Some(failure) = verification.feedback() else {
                return Ok(Build::Passed);
            };
            if let Verification::Failed { step, .. } = &verification {
                info!(step = %step, "local verification failed");
            }

            // Only markers from this claim count; a previous holder's retries do
            // not. The local count caps the loop if markers go missing.
            attempts += 1;
            let comments = self.s.store.comments(marker_item)?;
            let recorded = markers::highest_count(&comments, RetryKind::Local, Some(token.acked_at));
            let count = (recorded + 1).max(attempts);
            if count > max {
                return Ok(Build::Exhausted(failure));
            }
            self.s.store.post_comment(
                marker_item,
                &format!(
                    "Local verification failed (retry {count}/{max}). Revising tests and implementation.\n\n{failure}\n\n{}",
                    markers::retry_trailer(RetryKind::Local, count)
                ),
            )?;

            let revise = Request {
                feedback: Some(&failure),
                ..*base
            };
            self.s
                .generator
                .generate_tests(&revise)
                .context("revising tests")?;
            feedback = Some(failure);
        }
    }

    /// CI phase after the ticket has been handed to review. Errors here fail
    /// the change and the ticket waiting on it.
    fn settle_ci(&self, change: u64, ticket: &Item, wt: &Worktree) -> Outcome {
        match ci::watch_and_fix(&self.s, change, ticket, wt) {
            Ok(CiOutcome::Green | CiOutcome::TimedOut) => Outcome::Completed(Status::Reviewing),
            Ok(CiOutcome::GaveUp) => Outcome::CiFailed,
            Err(e) => {
                warn!(change, "CI phase failed: {e:#}");
                self.s.fail(change, Status::Reviewing, &e);
                if ticket.number != change {
                    self.s.fail_linked_ticket(change, ticket.number, &e);
                }
                Outcome::Failed
            }
        }
    }

    /// Rework a change proposal the reviewer sent back.
    #[instrument(skip_all, fields(item = change.number))]
    pub fn process_change(&self, change: &Item) -> Outcome {
        let token = match self
            .s
            .lock()
            .acquire(change.number, Status::ChangesRequested, Status::Implementing)
        {
            Ok(token) => token,
            Err(e) => {
                log_lock_miss(change.number, &e);
                return Outcome::Skipped;
            }
        };
        match self.rework(change, &token) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("rework failed: {e:#}");
                self.s.fail(change.number, Status::Implementing, &e);
                Outcome::Failed
            }
        }
    }

    fn rework(&self, change: &Item, token: &ClaimToken) -> anyhow::Result<Outcome> {
        let n = change.number;
        let branches = change
            .branches
            .clone()
            .with_context(|| format!("#{n} has no branch information"))?;
        let ticket = match change.linked_ticket() {
            Some(t) => Some(self.s.store.get_item(t)?),
            None => None,
        };
        let counter = ticket.as_ref().map_or(n, |t| t.number);
        let max = self.s.config.lifecycle.max_review_retries;

        let feedback = self
            .s
            .store
            .latest_review_feedback(n)?
            .unwrap_or_else(|| "Changes were requested without details.".to_string());

        let rounds = markers::highest_count(&self.s.store.comments(counter)?, RetryKind::Review, None);
        if rounds >= max {
            self.give_up_on_change(n, ticket.as_ref(), &format!("review retries exhausted ({max})"), &feedback)?;
            return Ok(Outcome::Escalated);
        }
        let round = rounds + 1;
        self.s.store.post_comment(
            counter,
            &format!(
                "Reworking #{n} after review (round {round}/{max}).\n\n{}",
                markers::retry_trailer(RetryKind::Review, round)
            ),
        )?;

        let wt = self
            .workspace
            .checkout(
                &format!("pr-{n}"),
                &BranchSpec::Existing {
                    branch: branches.head.clone(),
                    base: branches.base.clone(),
                },
                self.s.clock.now(),
            )
            .context("creating workspace")?;

        let (title, spec) = ticket
            .as_ref()
            .map_or((change.title.as_str(), change.body.as_str()), |t| {
                (t.title.as_str(), t.body.as_str())
            });
        let request = Request {
            number: counter,
            title,
            spec,
            feedback: Some(&feedback),
            test_dir: &self.s.config.lifecycle.test_dir,
            work_dir: wt.path(),
        };

        if let Build::Exhausted(last) = self.build(n, &request, token)? {
            self.give_up_on_change(
                n,
                ticket.as_ref(),
                &format!("{TEST_DESIGN}: local verification failing during rework"),
                &last,
            )?;
            return Ok(Outcome::Escalated);
        }

        match wt
            .git()
            .commit_all(wt.path(), &format!("Address review feedback on #{n} (round {round})"))?
        {
            CommitOutcome::Committed { .. } => {}
            CommitOutcome::NoOp => {
                self.s.note(
                    n,
                    &format!(
                        "No changes to commit after review feedback. Returning to `{}`.",
                        Status::ChangesRequested
                    ),
                );
                self.s
                    .lock()
                    .transition(n, Status::Implementing, Status::ChangesRequested)?;
                return Ok(Outcome::NoOp);
            }
            CommitOutcome::Failed { output } => anyhow::bail!("commit failed: {output}"),
        }
        wt.git().push(wt.path(), &branches.head).context("pushing branch")?;
        self.s.lock().transition(n, Status::Implementing, Status::Reviewing)?;
        self.s.note(n, &format!("Pushed rework round {round}/{max}. Back to review."));

        let subject = ticket.clone().unwrap_or_else(|| change.clone());
        Ok(self.settle_ci(n, &subject, &wt))
    }

    /// Escalate the linked ticket (if any) and fail the change.
    fn give_up_on_change(&self, change: u64, ticket: Option<&Item>, reason: &str, details: &str) -> anyhow::Result<()> {
        if let Some(ticket) = ticket {
            let current = ticket.status().unwrap_or(Status::Reviewing);
            self.s
                .escalate(ticket.number, current, reason, &format!("From #{change}:\n\n{details}"))?;
        }
        self.s
            .lock()
            .mark_failed(change, Status::Implementing, reason)?;
        Ok(())
    }
}

impl RoleAgent for Implementer<'_> {
    fn role(&self) -> Role {
        Role::Implementer
    }

    fn run_cycle(&mut self) -> anyhow::Result<CycleReport> {
        let _span = info_span!("cycle", agent = %self.s.agent).entered();
        let mut report = CycleReport {
            recovered: self.s.sweep_stale()?,
            ..CycleReport::default()
        };
        for ticket in self.s.store.list_items(ItemKind::Ticket, &Status::Ready.label())? {
            let outcome = self.process_ticket(&ticket);
            report.record(ticket.number, outcome);
        }
        for change in self
            .s
            .store
            .list_items(ItemKind::Change, &Status::ChangesRequested.label())?
        {
            let outcome = self.process_change(&change);
            report.record(change.number, outcome);
        }
        Ok(report)
    }
}
