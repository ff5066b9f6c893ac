mod common;

use std::time::Duration;

use relay::clock::{Clock, ManualClock};
use relay::config::LockConfig;
use relay::identity::{AgentId, Role};
use relay::lock::{LockCoordinator, LockError};
use relay::status::Status;
use relay::store::RemoteStore;
use relay::store::memory::MemoryStore;

fn agents(ids: &[&str]) -> Vec<AgentId> {
    ids.iter()
        .map(|id| AgentId::new(Role::Implementer, id).unwrap())
        .collect()
}

fn coordinators<'a>(
    store: &'a MemoryStore,
    clock: &'a ManualClock,
    agents: &'a [AgentId],
    settings: &'a LockConfig,
) -> Vec<LockCoordinator<'a>> {
    agents
        .iter()
        .map(|a| LockCoordinator::new(store, clock, a, settings))
        .collect()
}

#[test]
fn concurrent_claimants_yield_exactly_one_winner() {
    let (store, clock) = common::store();
    store.seed_ticket(7, "t", "b", &["status:ready"]);
    let settings = LockConfig::default();
    let agents = agents(&["w-a", "w-b", "w-c", "w-d"]);
    let racers = coordinators(&store, &clock, &agents, &settings);

    // Everyone probes before anyone's ACK is visible, then broadcasts.
    for r in &racers {
        r.probe(7).unwrap();
    }
    let pending: Vec<_> = racers
        .iter()
        .map(|r| {
            clock.advance(Duration::from_millis(5));
            r.broadcast(7).unwrap()
        })
        .collect();
    clock.sleep(settings.settle_delay());

    let results: Vec<_> = racers
        .iter()
        .zip(pending)
        .map(|(r, p)| r.resolve(p, Status::Ready, Status::Implementing))
        .collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].agent, "w-a");
    for loser in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(loser, &LockError::LostRace { winner: "w-a".into() });
    }
    assert_eq!(store.item(7).unwrap().statuses(), vec![Status::Implementing]);
}

#[test]
fn later_claim_by_100ms_loses_and_names_the_winner() {
    let (store, clock) = common::store();
    store.seed_ticket(7, "t", "b", &["status:ready"]);
    let settings = LockConfig::default();
    let agents = agents(&["w-1", "w-2"]);
    let racers = coordinators(&store, &clock, &agents, &settings);
    let (first, second) = (&racers[0], &racers[1]);

    let p1 = first.broadcast(7).unwrap();
    clock.advance(Duration::from_millis(100));
    let p2 = second.broadcast(7).unwrap();
    clock.sleep(settings.settle_delay());

    let err = second.resolve(p2, Status::Ready, Status::Implementing).unwrap_err();
    assert_eq!(err, LockError::LostRace { winner: "w-1".into() });
    assert!(err.is_contention());
    let token = first.resolve(p1, Status::Ready, Status::Implementing).unwrap();
    assert_eq!(token.status, Status::Implementing);
}

#[test]
fn fresh_claim_blocks_others_but_not_its_holder() {
    let (store, clock) = common::store();
    store.seed_ticket(7, "t", "b", &["status:ready"]);
    let settings = LockConfig::default();
    let agents = agents(&["w-1", "w-2"]);
    let racers = coordinators(&store, &clock, &agents, &settings);
    let (holder, other) = (&racers[0], &racers[1]);

    holder.acquire(7, Status::Ready, Status::Implementing).unwrap();
    clock.advance(Duration::from_secs(60));

    assert_eq!(
        other.probe(7),
        Err(LockError::HeldByOther { holder: "w-1".into() })
    );
    assert_eq!(holder.probe(7), Ok(()));
    // The loser wrote nothing.
    assert_eq!(store.comments(7).unwrap().len(), 1);
}

#[test]
fn claims_of_another_role_do_not_compete() {
    let (store, clock) = common::store();
    store.seed_ticket(7, "t", "b", &["status:reviewing"]);
    let settings = LockConfig::default();
    let implementer = AgentId::new(Role::Implementer, "w-1").unwrap();
    let reviewer = AgentId::new(Role::Reviewer, "r-1").unwrap();

    LockCoordinator::new(&store, &clock, &implementer, &settings)
        .broadcast(7)
        .unwrap();
    clock.advance(Duration::from_millis(50));

    let token = LockCoordinator::new(&store, &clock, &reviewer, &settings)
        .acquire(7, Status::Reviewing, Status::InReview)
        .unwrap();
    assert_eq!(token.agent, "r-1");
}

#[test]
fn race_winner_keeps_the_lock_after_the_loser_acks() {
    let (store, clock) = common::store();
    store.seed_ticket(7, "t", "b", &["status:ready"]);
    let settings = LockConfig::default();
    let agents = agents(&["w-1", "w-2", "w-3"]);
    let racers = coordinators(&store, &clock, &agents, &settings);
    let (winner, loser, third) = (&racers[0], &racers[1], &racers[2]);

    let p1 = winner.broadcast(7).unwrap();
    clock.advance(Duration::from_millis(100));
    let p2 = loser.broadcast(7).unwrap();
    clock.sleep(settings.settle_delay());
    assert!(loser.resolve(p2, Status::Ready, Status::Implementing).is_err());
    winner.resolve(p1, Status::Ready, Status::Implementing).unwrap();

    clock.advance(Duration::from_secs(60));

    // The loser's newer ACK does not displace the holder.
    assert_eq!(winner.probe(7), Ok(()));
    let token = winner
        .acquire(7, Status::Implementing, Status::Implementing)
        .unwrap();
    assert_eq!(token.agent, "w-1");
    assert_eq!(
        third.probe(7),
        Err(LockError::HeldByOther { holder: "w-1".into() })
    );
    assert_eq!(
        loser.probe(7),
        Err(LockError::HeldByOther { holder: "w-1".into() })
    );
}
