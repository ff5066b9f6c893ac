//! Reviewer: green `reviewing` changes get a verdict and move to
//! `approved` or `changes-requested`.

use anyhow::Context;
use tracing::{debug, info, info_span, instrument, warn};

use super::{CycleReport, Outcome, RoleAgent, Services, log_lock_miss};
use crate::identity::Role;
use crate::status::Status;
use crate::store::{Item, ItemKind};
use crate::verdict::ReviewVerdict;

pub struct Reviewer<'a> {
    s: Services<'a>,
}

impl<'a> Reviewer<'a> {
    pub const fn new(services: Services<'a>) -> Self {
        Self { s: services }
    }

    /// Review one change if its build is green and the lock can be taken.
    #[instrument(skip_all, fields(item = change.number))]
    pub fn process_change(&self, change: &Item) -> Outcome {
        match self.s.store.build_status(change.number) {
            Ok(status) if status.is_green() => {}
            Ok(status) => {
                debug!(state = ?status.state, "build not green; not reviewing yet");
                return Outcome::Skipped;
            }
            Err(e) => {
                warn!("could not read build status: {e}");
                return Outcome::Skipped;
            }
        }

        if let Err(e) = self
            .s
            .lock()
            .acquire(change.number, Status::Reviewing, Status::InReview)
        {
            log_lock_miss(change.number, &e);
            return Outcome::Skipped;
        }

        match self.review(change) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("review failed: {e:#}");
                self.s.fail(change.number, Status::InReview, &e);
                if let Some(ticket) = change.linked_ticket() {
                    self.s.fail_linked_ticket(change.number, ticket, &e);
                }
                Outcome::Failed
            }
        }
    }

    fn review(&self, change: &Item) -> anyhow::Result<Outcome> {
        let n = change.number;
        let diff = self.s.store.change_diff(n).context("fetching diff")?;
        if diff.trim().is_empty() {
            anyhow::bail!("#{n} has an empty diff");
        }
        let ticket = match change.linked_ticket() {
            Some(t) => Some(self.s.store.get_item(t).context("fetching linked ticket")?),
            None => None,
        };
        let spec = ticket.as_ref().map_or(change.body.as_str(), |t| t.body.as_str());

        let output = self.s.generator.review_change(spec, &diff).context("running review")?;
        let verdict = ReviewVerdict::parse(&output)?;
        let lock = self.s.lock();

        if verdict.blocking() {
            lock.transition(n, Status::InReview, Status::ChangesRequested)?;
            let body = verdict.change_request_body();
            if let Err(e) = self.s.store.request_changes(n, &body) {
                warn!("request_changes failed, leaving a comment instead: {e}");
                self.s.note(n, &body);
            }
            info!(findings = verdict.findings.len(), "changes requested");
            return Ok(Outcome::Completed(Status::ChangesRequested));
        }

        lock.transition(n, Status::InReview, Status::Approved)?;
        let body = verdict.approval_body(self.s.agent.id());
        if let Err(e) = self.s.store.approve_change(n, &body) {
            warn!("approve failed, leaving a comment instead: {e}");
            self.s.note(n, &body);
        }
        if let Some(ticket) = ticket.as_ref().filter(|t| t.has_status(Status::Reviewing)) {
            if let Err(e) = lock.transition(ticket.number, Status::Reviewing, Status::Approved) {
                warn!(ticket = ticket.number, "could not mark ticket approved: {e}");
            }
        }
        info!("approved");

        let review = &self.s.config.review;
        if review.auto_merge {
            match self.s.store.merge_change(n, review.merge_method) {
                Ok(()) => info!(method = ?review.merge_method, "merged"),
                Err(e) => {
                    warn!("auto-merge failed: {e}");
                    self.s
                        .note(n, &format!("Auto-merge failed: {e}\n\nPlease merge manually."));
                }
            }
        }
        Ok(Outcome::Completed(Status::Approved))
    }
}

impl RoleAgent for Reviewer<'_> {
    fn role(&self) -> Role {
        Role::Reviewer
    }

    fn run_cycle(&mut self) -> anyhow::Result<CycleReport> {
        let _span = info_span!("cycle", agent = %self.s.agent).entered();
        let mut report = CycleReport {
            recovered: self.s.sweep_stale()?,
            ..CycleReport::default()
        };
        for change in self.s.store.list_items(ItemKind::Change, &Status::Reviewing.label())? {
            let outcome = self.process_change(&change);
            report.record(change.number, outcome);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::identity::AgentId;
    use crate::lifecycle::testing::{ScriptedGenerator, Step};
    use crate::store::memory::{MemoryStore, ReviewRecord};
    use crate::store::{BranchPair, BuildState, MergeMethod};

    const APPROVE: &str = r#"{"decision":"APPROVE","summary":"Implements the ticket.","issues":[
        {"severity":"trivial","file":"greet.sh","line":1,"description":"missing newline","suggestion":""}]}"#;
    const BLOCK: &str = r#"{"decision":"APPROVE","summary":"Close.","issues":[
        {"severity":"major","file":"greet.sh","line":1,"description":"ignores the name argument","suggestion":"use $1"}]}"#;

    struct Fixture {
        store: MemoryStore,
        clock: ManualClock,
        generator: ScriptedGenerator,
        config: Config,
        agent: AgentId,
    }

    impl Fixture {
        fn new(reply: &str) -> Self {
            let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
            let store = MemoryStore::new(clock.clone());
            store.seed_ticket(42, "Add greeting", "Print hello.", &["status:reviewing"]);
            store.seed_change(
                43,
                "[auto] Add greeting",
                "Closes #42",
                &["status:reviewing"],
                BranchPair {
                    head: "auto/issue-42".into(),
                    base: "main".into(),
                },
            );
            store.set_diff(43, "+echo hello\n");
            store.script_builds(43, &[BuildState::Success]);
            let generator = ScriptedGenerator::default();
            *generator.reviews.borrow_mut() = vec![Step::reply(reply)].into();
            Self {
                store,
                clock,
                generator,
                config: Config::for_repo("acme/widgets"),
                agent: AgentId::new(Role::Reviewer, "r-1").unwrap(),
            }
        }

        fn reviewer(&self) -> Reviewer<'_> {
            Reviewer::new(Services {
                store: &self.store,
                clock: &self.clock,
                generator: &self.generator,
                config: &self.config,
                agent: &self.agent,
            })
        }
    }

    #[test]
    fn clean_verdict_approves_change_and_ticket() {
        let fx = Fixture::new(APPROVE);

        let report = fx.reviewer().run_cycle().unwrap();

        assert_eq!(report.outcome(43), Some(&Outcome::Completed(Status::Approved)));
        assert_eq!(fx.store.item(43).unwrap().statuses(), vec![Status::Approved]);
        assert_eq!(fx.store.item(42).unwrap().statuses(), vec![Status::Approved]);
        let ReviewRecord::Approved(body) = &fx.store.reviews(43)[0] else {
            panic!("expected approval");
        };
        assert!(body.contains("missing newline"));
        assert_eq!(fx.store.merged(43), None);
    }

    #[test]
    fn major_finding_requests_changes() {
        let fx = Fixture::new(BLOCK);

        let report = fx.reviewer().run_cycle().unwrap();

        assert_eq!(report.outcome(43), Some(&Outcome::Completed(Status::ChangesRequested)));
        assert_eq!(fx.store.item(43).unwrap().status(), Some(Status::ChangesRequested));
        assert_eq!(fx.store.item(42).unwrap().status(), Some(Status::Reviewing));
        let ReviewRecord::ChangesRequested(body) = &fx.store.reviews(43)[0] else {
            panic!("expected change request");
        };
        assert!(body.contains("ignores the name argument"));
    }

    #[test]
    fn red_build_is_not_locked() {
        let fx = Fixture::new(APPROVE);
        fx.store.script_builds(43, &[BuildState::Failure]);

        let report = fx.reviewer().run_cycle().unwrap();

        assert_eq!(report.outcome(43), Some(&Outcome::Skipped));
        assert!(fx.store.comment_bodies(43).is_empty());
        assert_eq!(fx.generator.count("review_change"), 0);
    }

    #[test]
    fn auto_merge_uses_configured_method() {
        let mut fx = Fixture::new(APPROVE);
        fx.config.review.auto_merge = true;
        fx.config.review.merge_method = MergeMethod::Rebase;

        fx.reviewer().run_cycle().unwrap();

        assert_eq!(fx.store.merged(43), Some(MergeMethod::Rebase));
    }

    #[test]
    fn merge_failure_leaves_comment_but_stays_approved() {
        let mut fx = Fixture::new(APPROVE);
        fx.config.review.auto_merge = true;
        fx.store.fail_next("merge_change", 1);

        fx.reviewer().run_cycle().unwrap();

        assert_eq!(fx.store.item(43).unwrap().status(), Some(Status::Approved));
        let last = fx.store.comment_bodies(43).pop().unwrap();
        assert!(last.contains("Auto-merge failed"));
    }

    #[test]
    fn unparseable_review_marks_change_failed() {
        let fx = Fixture::new("Looks fine to me.");

        let report = fx.reviewer().run_cycle().unwrap();

        assert_eq!(report.outcome(43), Some(&Outcome::Failed));
        assert_eq!(fx.store.item(43).unwrap().status(), Some(Status::Failed));
        assert_eq!(fx.store.item(42).unwrap().statuses(), vec![Status::Failed]);
        let last = fx.store.comment_bodies(42).pop().unwrap();
        assert!(last.contains("change #43 failed"), "{last}");
    }

    #[test]
    fn backend_failure_fails_change_and_ticket() {
        let fx = Fixture::new(APPROVE);
        *fx.generator.reviews.borrow_mut() = vec![Step::failing()].into();

        let report = fx.reviewer().run_cycle().unwrap();

        assert_eq!(report.outcome(43), Some(&Outcome::Failed));
        assert_eq!(fx.store.item(43).unwrap().status(), Some(Status::Failed));
        assert_eq!(fx.store.item(42).unwrap().status(), Some(Status::Failed));
    }
}
