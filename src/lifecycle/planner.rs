//! Spec-writer: reviews specifications, revises them from escalations, and
//! files new tickets from free-text stories.

use anyhow::Context;
use tracing::{debug, info, info_span, instrument, warn};

use super::{CycleReport, Outcome, RoleAgent, Services, log_lock_miss};
use crate::backend::SpecRequest;
use crate::identity::Role;
use crate::markers::{self, RetryKind};
use crate::status::Status;
use crate::store::{Comment, Item, ItemKind};
use crate::verdict::ReviewVerdict;

/// Role name carried by escalations that come out of spec review.
const SPEC_REVIEWER: &str = "spec-reviewer";

const TITLE_MAX_CHARS: usize = 72;

/// Feedback for a `failed` ticket that carries no failure report.
const FAILURE_UNAVAILABLE: &str = "The item failed; failure details are unavailable.";

/// A ticket ready to be filed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub title: String,
    pub body: String,
}

pub struct Planner<'a> {
    s: Services<'a>,
}

impl<'a> Planner<'a> {
    pub const fn new(services: Services<'a>) -> Self {
        Self { s: services }
    }

    /// Ask the backend for a specification of `story`.
    pub fn draft(&self, story: &str) -> anyhow::Result<Draft> {
        let story = story.trim();
        anyhow::ensure!(!story.is_empty(), "story is empty");
        let spec = self
            .s
            .generator
            .create_spec(&SpecRequest {
                story,
                current: None,
                feedback: None,
            })
            .context("generating specification")?;
        anyhow::ensure!(!spec.trim().is_empty(), "backend returned an empty specification");
        Ok(Draft {
            title: title_for(story),
            body: format!("{}\n\n---\n\n**User story**\n\n{story}\n", spec.trim()),
        })
    }

    /// File `draft` as a new ticket awaiting spec review.
    pub fn file(&self, draft: &Draft) -> anyhow::Result<u64> {
        let number = self
            .s
            .store
            .create_item(&draft.title, &draft.body, &[Status::SpecReview.label()])
            .context("creating ticket")?;
        info!(item = number, title = %draft.title, "ticket filed");
        Ok(number)
    }

    /// Review one `spec-review` ticket under the lock.
    #[instrument(skip_all, fields(item = ticket.number))]
    pub fn process_review(&self, ticket: &Item) -> Outcome {
        if let Err(e) = self
            .s
            .lock()
            .acquire(ticket.number, Status::SpecReview, Status::SpecReviewing)
        {
            log_lock_miss(ticket.number, &e);
            return Outcome::Skipped;
        }
        match self.review(ticket) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("spec review failed: {e:#}");
                self.s.fail(ticket.number, Status::SpecReviewing, &e);
                Outcome::Failed
            }
        }
    }

    fn review(&self, ticket: &Item) -> anyhow::Result<Outcome> {
        let n = ticket.number;
        let output = self.s.generator.review_spec(&ticket.body).context("running spec review")?;
        let verdict = ReviewVerdict::parse(&output)?;
        let lock = self.s.lock();

        if verdict.blocking() {
            let body = markers::escalation(
                SPEC_REVIEWER,
                "specification rejected in review",
                &verdict.change_request_body(),
            );
            self.s.store.post_comment(n, &body)?;
            lock.transition(n, Status::SpecReviewing, Status::Escalated)?;
            info!(findings = verdict.findings.len(), "specification rejected");
            return Ok(Outcome::Escalated);
        }

        lock.transition(n, Status::SpecReviewing, Status::Ready)?;
        self.s.note(n, &verdict.approval_body(self.s.agent.id()));
        info!("specification approved");
        Ok(Outcome::Completed(Status::Ready))
    }

    /// Revise an `escalated` or `failed` ticket's specification, or retire it
    /// once the revision bound is reached.
    #[instrument(skip_all, fields(item = ticket.number, status = %status))]
    pub fn process_revision(&self, ticket: &Item, status: Status) -> Outcome {
        let n = ticket.number;
        let comments = match self.s.store.comments(n) {
            Ok(comments) => comments,
            Err(e) => {
                warn!("could not read comments: {e}");
                return Outcome::Skipped;
            }
        };
        let max = self.s.config.lifecycle.max_spec_revisions;
        let revisions = markers::highest_count(&comments, RetryKind::Revision, None);
        let open = markers::unresolved_escalation(&comments);

        if revisions >= max {
            if status == Status::Escalated {
                return self.retire(n, max);
            }
            debug!(revisions, "revision limit reached; leaving failed item alone");
            return Outcome::Skipped;
        }

        let bridging = open.is_none();
        let feedback = match open {
            Some(escalation) => escalation.body,
            None if status == Status::Failed => latest_failure(&comments)
                .map_or_else(|| FAILURE_UNAVAILABLE.to_string(), |failure| failure.body.clone()),
            None => {
                warn!("escalated without an escalation comment");
                return Outcome::Skipped;
            }
        };

        if let Err(e) = self.s.lock().acquire(n, status, Status::SpecReviewing) {
            log_lock_miss(n, &e);
            return Outcome::Skipped;
        }

        let result = if bridging {
            self.bridge(n, &feedback)
                .and_then(|bridged| self.revise(ticket, &bridged, revisions + 1))
        } else {
            self.revise(ticket, &feedback, revisions + 1)
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("revision failed: {e:#}");
                self.s.fail(n, Status::SpecReviewing, &e);
                Outcome::Failed
            }
        }
    }

    /// Turn a failure report into an escalation the revision can answer.
    fn bridge(&self, n: u64, failure: &str) -> anyhow::Result<String> {
        let body = markers::escalation(
            Role::SpecWriter.as_str(),
            "processing failed; revising the specification",
            failure,
        );
        self.s.store.post_comment(n, &body)?;
        info!("bridged failure into an escalation");
        Ok(body)
    }

    fn revise(&self, ticket: &Item, feedback: &str, revision: u32) -> anyhow::Result<Outcome> {
        let n = ticket.number;
        let max = self.s.config.lifecycle.max_spec_revisions;
        // Counted before the backend runs; a failing revision still uses one up.
        self.s.store.post_comment(
            n,
            &format!(
                "Revising specification (revision {revision}/{max}).\n\n{}",
                markers::retry_trailer(RetryKind::Revision, revision),
            ),
        )?;
        let spec = self
            .s
            .generator
            .create_spec(&SpecRequest {
                story: &ticket.title,
                current: Some(&ticket.body),
                feedback: Some(feedback),
            })
            .context("revising specification")?;
        anyhow::ensure!(!spec.trim().is_empty(), "backend returned an empty specification");

        self.s.store.update_body(n, spec.trim())?;
        self.s.note(
            n,
            &format!("Specification revised by `{}` (revision {revision}/{max}).", self.s.agent),
        );
        self.s.lock().transition(n, Status::SpecReviewing, Status::SpecReview)?;
        info!(revision, "specification revised");
        Ok(Outcome::Completed(Status::SpecReview))
    }

    /// Out of revisions: say so once and park the ticket in `failed`.
    fn retire(&self, n: u64, max: u32) -> Outcome {
        if let Err(e) = self.s.lock().acquire(n, Status::Escalated, Status::Failed) {
            log_lock_miss(n, &e);
            return Outcome::Skipped;
        }
        self.s.note(
            n,
            &format!(
                "**Specification revision limit reached** ({max} revisions). Needs a human.\n\n{}",
                markers::retry_trailer(RetryKind::Revision, max),
            ),
        );
        warn!(item = n, "revision limit reached");
        Outcome::Failed
    }
}

/// Latest failure report on the item, whichever role wrote it.
fn latest_failure(comments: &[Comment]) -> Option<&Comment> {
    markers::sorted(comments)
        .into_iter()
        .rev()
        .find(|c| c.body.starts_with("**Processing failed**"))
}

/// First non-empty line of the story, without heading marks, shortened.
fn title_for(story: &str) -> String {
    let line = story
        .lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .unwrap_or("Untitled story");
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line.to_string();
    }
    let cut: String = line.chars().take(TITLE_MAX_CHARS - 3).collect();
    format!("{}...", cut.trim_end())
}

impl RoleAgent for Planner<'_> {
    fn role(&self) -> Role {
        Role::SpecWriter
    }

    fn run_cycle(&mut self) -> anyhow::Result<CycleReport> {
        let _span = info_span!("cycle", agent = %self.s.agent).entered();
        let mut report = CycleReport {
            recovered: self.s.sweep_stale()?,
            ..CycleReport::default()
        };
        // Every queue is read before any item moves, so a ticket handled in
        // one queue is not picked up again from another in the same cycle.
        let reviews = self.s.store.list_items(ItemKind::Ticket, &Status::SpecReview.label())?;
        let mut revisable = Vec::new();
        for status in [Status::Escalated, Status::Failed] {
            for ticket in self.s.store.list_items(ItemKind::Ticket, &status.label())? {
                revisable.push((ticket, status));
            }
        }

        for ticket in reviews {
            let outcome = self.process_review(&ticket);
            report.record(ticket.number, outcome);
        }
        for (ticket, status) in revisable {
            let outcome = self.process_revision(&ticket, status);
            report.record(ticket.number, outcome);
        }
        Ok(report)
    }
}
