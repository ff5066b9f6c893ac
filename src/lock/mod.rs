//! Mutual exclusion over the tracker's comment log.
//!
//! There is no compare-and-swap in the tracker, so a claim is an `ACK` comment
//! and the lock itself is the item's `status:` label. Competing claims posted
//! within the settle delay are ordered by their embedded timestamps and the
//! earliest wins. Correctness assumes agent clocks roughly agree and the
//! settle delay exceeds the tracker's write propagation time.

pub mod stale;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, to_delta};
use crate::config::LockConfig;
use crate::identity::AgentId;
use crate::markers::{self, Marker};
use crate::status::Status;
use crate::store::{Comment, RemoteStore, StoreError};

/// Proof that the caller won an item. Carries the claim timestamp so later
/// counters can be scoped to this claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    pub item: u64,
    pub agent: String,
    pub status: Status,
    pub acked_at: DateTime<Utc>,
}

/// A broadcast claim that has not been resolved yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingClaim {
    pub item: u64,
    pub at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("locked by {holder} (claim still fresh)")]
    HeldByOther { holder: String },

    #[error("could not read claims: {0}")]
    Scan(#[source] StoreError),

    #[error("could not broadcast claim: {0}")]
    Broadcast(#[source] StoreError),

    #[error("own claim not observed after settle delay")]
    OwnClaimNotObserved,

    #[error("lost race to {winner}")]
    LostRace { winner: String },

    #[error("failed to add label {label}: {source}")]
    TransitionFailed { label: String, source: StoreError },

    #[error("label {label} not present after transition")]
    VerificationFailed { label: String },
}

impl LockError {
    /// Contention is expected traffic, not a fault.
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::HeldByOther { .. } | Self::LostRace { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Ack {
    agent: String,
    at_ms: i64,
}

pub struct LockCoordinator<'a> {
    store: &'a dyn RemoteStore,
    clock: &'a dyn Clock,
    agent: &'a AgentId,
    settings: &'a LockConfig,
}

impl<'a> LockCoordinator<'a> {
    pub fn new(
        store: &'a dyn RemoteStore,
        clock: &'a dyn Clock,
        agent: &'a AgentId,
        settings: &'a LockConfig,
    ) -> Self {
        Self {
            store,
            clock,
            agent,
            settings,
        }
    }

    /// Claim `item` and move it from `from` to `to`.
    #[instrument(skip(self), fields(agent = %self.agent))]
    pub fn acquire(&self, item: u64, from: Status, to: Status) -> Result<ClaimToken, LockError> {
        self.probe(item)?;
        let pending = self.broadcast(item)?;
        self.clock.sleep(self.settings.settle_delay());
        self.resolve(pending, from, to)
    }

    /// Fail fast if another agent holds a fresh claim. Writes nothing.
    ///
    /// The holder is the earliest fresh ACK of this role; later ACKs are
    /// race losers and never block.
    pub fn probe(&self, item: u64) -> Result<(), LockError> {
        let comments = self.store.comments(item).map_err(LockError::Scan)?;
        let horizon = self.clock.now_ms() - window_ms(self.settings.freshness_window());
        let holder = self
            .acks(&comments)
            .into_iter()
            .filter(|a| a.at_ms >= horizon)
            .min_by_key(|a| a.at_ms);
        match holder {
            Some(ack) if ack.agent != self.agent.id() => {
                debug!(item, holder = %ack.agent, "claim held by another agent");
                Err(LockError::HeldByOther { holder: ack.agent })
            }
            _ => Ok(()),
        }
    }

    /// Post this agent's ACK.
    pub fn broadcast(&self, item: u64) -> Result<PendingClaim, LockError> {
        let at_ms = self.clock.now_ms();
        let body = markers::ack(self.agent.role().as_str(), self.agent.id(), at_ms);
        self.store
            .post_comment(item, &body)
            .map_err(LockError::Broadcast)?;
        Ok(PendingClaim { item, at_ms })
    }

    /// Re-scan claims, decide the race, and on a win perform the label transition.
    pub fn resolve(&self, pending: PendingClaim, from: Status, to: Status) -> Result<ClaimToken, LockError> {
        let item = pending.item;
        let comments = self.store.comments(item).map_err(LockError::Scan)?;
        let horizon = self.clock.now_ms() - window_ms(self.settings.race_window());

        let mut racers: Vec<Ack> = self
            .acks(&comments)
            .into_iter()
            .filter(|a| a.at_ms >= horizon)
            .collect();
        // Stable: equal timestamps keep the order the store returned them in.
        racers.sort_by_key(|a| a.at_ms);

        let own_seen = racers
            .iter()
            .any(|a| a.agent == self.agent.id() && a.at_ms == pending.at_ms);
        if !own_seen {
            warn!(item, "own ACK missing from re-scan");
            return Err(LockError::OwnClaimNotObserved);
        }
        if let Some(first) = racers.first() {
            if first.agent != self.agent.id() {
                debug!(item, winner = %first.agent, "lost claim race");
                return Err(LockError::LostRace {
                    winner: first.agent.clone(),
                });
            }
        }

        if let Err(e) = self.store.remove_label(item, &from.label()) {
            warn!(item, label = %from, "could not remove previous status: {e}");
        }
        self.store
            .add_label(item, &to.label())
            .map_err(|source| LockError::TransitionFailed {
                label: to.label(),
                source,
            })?;

        let verified = self
            .store
            .get_item(item)
            .is_ok_and(|current| current.has_status(to));
        if !verified {
            return Err(LockError::VerificationFailed { label: to.label() });
        }

        info!(item, status = %to, "lock acquired");
        Ok(ClaimToken {
            item,
            agent: self.agent.id().to_string(),
            status: to,
            acked_at: DateTime::from_timestamp_millis(pending.at_ms).unwrap_or_else(|| self.clock.now()),
        })
    }

    /// Plain status change for a lock this agent holds: remove best-effort, add hard.
    pub fn transition(&self, item: u64, from: Status, to: Status) -> Result<(), StoreError> {
        if let Err(e) = self.store.remove_label(item, &from.label()) {
            warn!(item, label = %from, "could not remove status: {e}");
        }
        self.store.add_label(item, &to.label())?;
        debug!(item, %from, %to, "transition");
        Ok(())
    }

    /// Record a transaction failure: move to `failed` and leave the error on the item.
    pub fn mark_failed(&self, item: u64, from: Status, error: &str) -> Result<(), StoreError> {
        warn!(item, agent = %self.agent, "marking failed: {error}");
        self.transition(item, from, Status::Failed)?;
        let body = format!(
            "**Processing failed** ({role} `{agent}`, was `{from}`)\n\n```\n{error}\n```",
            role = self.agent.role(),
            agent = self.agent,
        );
        self.store.post_comment(item, &body)
    }

    fn acks(&self, comments: &[Comment]) -> Vec<Ack> {
        let role = self.agent.role().as_str();
        comments
            .iter()
            .filter_map(|c| match markers::parse(&c.body) {
                Marker::Ack {
                    role: r,
                    agent,
                    at_ms,
                } if r == role => Some(Ack { agent, at_ms }),
                _ => None,
            })
            .collect()
    }
}

fn window_ms(window: std::time::Duration) -> i64 {
    to_delta(window).num_milliseconds()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::Role;
    use crate::store::memory::MemoryStore;

    const ITEM: u64 = 7;

    fn setup() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let store = MemoryStore::new(clock.clone());
        store.seed_ticket(ITEM, "t", "spec", &["status:ready"]);
        (store, clock)
    }

    fn agent(id: &str) -> AgentId {
        AgentId::new(Role::Implementer, id).unwrap()
    }

    #[test]
    fn uncontested_acquire_transitions_label() {
        let (store, clock) = setup();
        let me = agent("w-1");
        let settings = LockConfig::default();
        let lock = LockCoordinator::new(&store, &clock, &me, &settings);

        let token = lock.acquire(ITEM, Status::Ready, Status::Implementing).unwrap();

        assert_eq!(token.agent, "w-1");
        assert_eq!(token.status, Status::Implementing);
        let item = store.item(ITEM).unwrap();
        assert_eq!(item.status(), Some(Status::Implementing));
        assert_eq!(clock.slept(), Duration::from_secs(2));
        assert!(store.comment_bodies(ITEM)[0].starts_with("ACK:implementer:w-1:"));
    }

    #[test]
    fn fresh_foreign_claim_blocks_without_writing() {
        let (store, clock) = setup();
        let ten_min_ago = clock.now() - chrono::TimeDelta::minutes(10);
        store.insert_comment_at(
            ITEM,
            &markers::ack("implementer", "w-2", ten_min_ago.timestamp_millis()),
            ten_min_ago,
        );
        let me = agent("w-1");
        let settings = LockConfig::default();
        let lock = LockCoordinator::new(&store, &clock, &me, &settings);

        let err = lock.acquire(ITEM, Status::Ready, Status::Implementing).unwrap_err();

        assert_eq!(err, LockError::HeldByOther { holder: "w-2".into() });
        assert!(err.is_contention());
        assert_eq!(store.calls("post_comment"), 0);
        assert_eq!(store.item(ITEM).unwrap().status(), Some(Status::Ready));
    }

    #[test]
    fn expired_foreign_claim_does_not_block() {
        let (store, clock) = setup();
        let long_ago = clock.now() - chrono::TimeDelta::minutes(31);
        store.insert_comment_at(
            ITEM,
            &markers::ack("implementer", "w-2", long_ago.timestamp_millis()),
            long_ago,
        );
        let me = agent("w-1");
        let settings = LockConfig::default();
        let lock = LockCoordinator::new(&store, &clock, &me, &settings);

        assert!(lock.acquire(ITEM, Status::Ready, Status::Implementing).is_ok());
    }

    #[test]
    fn claims_by_other_roles_are_ignored() {
        let (store, clock) = setup();
        store.insert_comment_at(
            ITEM,
            &markers::ack("reviewer", "r-1", clock.now_ms()),
            clock.now(),
        );
        let me = agent("w-1");
        let settings = LockConfig::default();
        let lock = LockCoordinator::new(&store, &clock, &me, &settings);

        assert!(lock.acquire(ITEM, Status::Ready, Status::Implementing).is_ok());
    }

    #[test]
    fn holder_reacquire_is_idempotent() {
        let (store, clock) = setup();
        let me = agent("w-1");
        let settings = LockConfig::default();
        let lock = LockCoordinator::new(&store, &clock, &me, &settings);

        lock.acquire(ITEM, Status::Ready, Status::Implementing).unwrap();
        clock.advance(Duration::from_secs(60));
        let again = lock.acquire(ITEM, Status::Ready, Status::Implementing);

        assert!(again.is_ok(), "{again:?}");
        let item = store.item(ITEM).unwrap();
        assert_eq!(item.statuses(), vec![Status::Implementing]);
    }

    #[test]
    fn missing_own_ack_is_reported() {
        let (store, clock) = setup();
        let me = agent("w-1");
        let settings = LockConfig::default();
        let lock = LockCoordinator::new(&store, &clock, &me, &settings);

        // A claim whose ACK never landed in the store.
        let phantom = PendingClaim {
            item: ITEM,
            at_ms: clock.now_ms(),
        };
        let err = lock.resolve(phantom, Status::Ready, Status::Implementing).unwrap_err();
        assert_eq!(err, LockError::OwnClaimNotObserved);
        assert_eq!(store.item(ITEM).unwrap().status(), Some(Status::Ready));
    }

    #[test]
    fn broadcast_failure_is_not_a_claim() {
        let (store, clock) = setup();
        store.fail_next("post_comment", 1);
        let me = agent("w-1");
        let settings = LockConfig::default();
        let lock = LockCoordinator::new(&store, &clock, &me, &settings);

        let err = lock.acquire(ITEM, Status::Ready, Status::Implementing).unwrap_err();
        assert!(matches!(err, LockError::Broadcast(_)));
    }

    #[test]
    fn remove_failure_is_tolerated_but_add_failure_is_not() {
        let (store, clock) = setup();
        let me = agent("w-1");
        let settings = LockConfig::default();
        let lock = LockCoordinator::new(&store, &clock, &me, &settings);

        store.fail_next("remove_label", 1);
        store.fail_next("add_label", 1);
        let err = lock.acquire(ITEM, Status::Ready, Status::Implementing).unwrap_err();
        assert!(matches!(err, LockError::TransitionFailed { .. }));

        clock.advance(Duration::from_secs(60));
        store.fail_next("remove_label", 1);
        let token = lock.acquire(ITEM, Status::Ready, Status::Implementing).unwrap();
        assert_eq!(token.status, Status::Implementing);
    }

    #[test]
    fn verification_failure_when_reread_fails() {
        let (store, clock) = setup();
        store.fail_next("get_item", 1);
        let me = agent("w-1");
        let settings = LockConfig::default();
        let lock = LockCoordinator::new(&store, &clock, &me, &settings);

        let err = lock.acquire(ITEM, Status::Ready, Status::Implementing).unwrap_err();
        assert_eq!(
            err,
            LockError::VerificationFailed {
                label: "status:implementing".into()
            }
        );
    }

    #[test]
    fn mark_failed_moves_label_and_records_error() {
        let (store, clock) = setup();
        let me = agent("w-1");
        let settings = LockConfig::default();
        let lock = LockCoordinator::new(&store, &clock, &me, &settings);
        lock.acquire(ITEM, Status::Ready, Status::Implementing).unwrap();

        lock.mark_failed(ITEM, Status::Implementing, "git push rejected").unwrap();

        assert_eq!(store.item(ITEM).unwrap().status(), Some(Status::Failed));
        let last = store.comment_bodies(ITEM).pop().unwrap();
        assert!(last.contains("Processing failed"));
        assert!(last.contains("git push rejected"));
    }
}
