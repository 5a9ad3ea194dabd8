//! Full competition walkthroughs, conservation and idempotency.

use chrono::{Duration, Utc};
use rust_decimal_macros::dec;

use wagerbook::engine::pool::PoolConfig;
use wagerbook::engine::EngineConfig;
use wagerbook::storage::Store;
use wagerbook::types::{
    CompetitionId, CompetitionMeta, CompetitionState, EntryReason, Gp, GrantPeriod, Response,
    WagerError,
};

use crate::harness::TestEngine;

fn pool_of(cap: u32) -> CompetitionMeta {
    CompetitionMeta {
        game: "Celeste".to_string(),
        max_participants: Some(cap),
    }
}

#[tokio::test]
async fn test_duel_with_side_bets() {
    let t = TestEngine::new();
    let a = t.funded("alice", 500).await;
    let b = t.funded("bob", 300).await;
    let c = t.funded("carol", 100).await;
    let d = t.funded("dave", 100).await;

    // A: creation escrows the creator's wager.
    let comp = t
        .engine
        .create_competition(&a, Some(&b), 100, "any%", CompetitionMeta::default())
        .await
        .unwrap();
    assert_eq!(comp.state, CompetitionState::Pending);
    assert_eq!(t.balance(&a).await, 400);

    // B: acceptance escrows the opponent and starts the clock.
    let comp = t.engine.respond(&comp.id, &b, Response::Accept).await.unwrap();
    assert_eq!(comp.state, CompetitionState::Active);
    assert_eq!(t.balance(&b).await, 200);
    assert_eq!(comp.end_at.unwrap() - comp.start_at.unwrap(), Duration::days(7));

    // C: side bets do not change the state.
    t.engine.place_bet(&comp.id, &c, &a, 50).await.unwrap();
    t.engine.place_bet(&comp.id, &d, &b, 30).await.unwrap();
    let comp = t.engine.get_competition(&comp.id).await.unwrap();
    assert_eq!(comp.state, CompetitionState::Active);
    assert_eq!(comp.bets.len(), 2);

    // D: alice wins.
    t.leaderboard.set_ranks("any%", &[("alice", 1, 312.4), ("bob", 2, 318.9)]);
    let done = t.engine.resolve(&comp.id).await.unwrap();
    assert_eq!(done.state, CompetitionState::Completed);
    assert_eq!(t.balance(&a).await, 600);
    assert_eq!(t.balance(&b).await, 200);
    assert_eq!(t.balance(&c).await, 130);
    assert_eq!(t.balance(&d).await, 70);

    // Every GP escrowed came back out.
    assert_eq!(t.net_movement(&done).await, 0);
    for id in [&a, &b, &c, &d] {
        assert!(t.engine.verify_account(id).await.unwrap());
    }
}

#[tokio::test]
async fn test_grant_twice_same_period() {
    let t = TestEngine::with_config(EngineConfig {
        stipend: 250,
        ..EngineConfig::default()
    });
    let a = t.funded("alice", 0).await;
    let period = GrantPeriod::new("2025-03");

    t.engine.run_periodic_grant(&period).await.unwrap();
    t.engine.run_periodic_grant(&period).await.unwrap();

    assert_eq!(t.balance(&a).await, 250);
    let stipends = t
        .engine
        .history(&a)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.reason == EntryReason::Stipend)
        .count();
    assert_eq!(stipends, 1);
}

#[tokio::test]
async fn test_resolve_is_idempotent() {
    let t = TestEngine::new();
    let a = t.funded("alice", 500).await;
    let b = t.funded("bob", 500).await;
    let c = t.funded("carol", 100).await;

    let comp = t
        .engine
        .create_competition(&a, Some(&b), 100, "any%", CompetitionMeta::default())
        .await
        .unwrap();
    t.engine.respond(&comp.id, &b, Response::Accept).await.unwrap();
    t.engine.place_bet(&comp.id, &c, &b, 40).await.unwrap();
    t.leaderboard.set_ranks("any%", &[("bob", 1, 1.0), ("alice", 2, 1.0)]);

    let first = t.engine.resolve(&comp.id).await.unwrap();
    let entries = t.engine.ledger().entries_for_reference(&comp.reference()).await.unwrap();

    let second = t.engine.resolve(&comp.id).await.unwrap();
    let after = t.engine.ledger().entries_for_reference(&comp.reference()).await.unwrap();

    assert_eq!(first.settlement, second.settlement);
    assert_eq!(entries, after);
    // Unopposed winning bettor: stake back plus the 50% house guarantee.
    assert_eq!(t.balance(&c).await, 120);
    assert_eq!(t.net_movement(&first).await, 20);
}

#[tokio::test]
async fn test_proportional_remainder_retained_by_house() {
    let t = TestEngine::new();
    let a = t.funded("alice", 100).await;
    let b = t.funded("bob", 100).await;
    let x = t.funded("xavier", 100).await;
    let y = t.funded("yolanda", 100).await;
    let z = t.funded("zed", 100).await;

    let comp = t
        .engine
        .create_competition(&a, Some(&b), 10, "any%", CompetitionMeta::default())
        .await
        .unwrap();
    t.engine.respond(&comp.id, &b, Response::Accept).await.unwrap();
    t.engine.place_bet(&comp.id, &x, &a, 31).await.unwrap();
    t.engine.place_bet(&comp.id, &y, &a, 13).await.unwrap();
    t.engine.place_bet(&comp.id, &z, &b, 10).await.unwrap();
    t.leaderboard.set_ranks("any%", &[("alice", 1, 1.0), ("bob", 2, 1.0)]);

    let done = t.engine.resolve(&comp.id).await.unwrap();
    let settlement = done.settlement.clone().unwrap();

    // floor(31 * 10 / 44) = 7, floor(13 * 10 / 44) = 2, 1 GP left over.
    assert_eq!(t.balance(&x).await, 100 - 31 + 31 + 7);
    assert_eq!(t.balance(&y).await, 100 - 13 + 13 + 2);
    assert_eq!(t.balance(&z).await, 90);
    assert_eq!(settlement.house_retained, 1);
    assert_eq!(settlement.house_bonus, 0);
    assert_eq!(t.net_movement(&done).await, -1);
}

#[tokio::test]
async fn test_configured_house_rate() {
    let t = TestEngine::with_config(EngineConfig {
        pool: PoolConfig {
            house_guarantee_rate: dec!(0.1),
        },
        ..EngineConfig::default()
    });
    let a = t.funded("alice", 100).await;
    let b = t.funded("bob", 100).await;
    let c = t.funded("carol", 100).await;

    let comp = t
        .engine
        .create_competition(&a, Some(&b), 10, "any%", CompetitionMeta::default())
        .await
        .unwrap();
    t.engine.respond(&comp.id, &b, Response::Accept).await.unwrap();
    t.engine.place_bet(&comp.id, &c, &a, 55).await.unwrap();
    t.leaderboard.set_ranks("any%", &[("alice", 1, 1.0)]);

    t.engine.resolve(&comp.id).await.unwrap();
    assert_eq!(t.balance(&c).await, 105);
}

#[tokio::test]
async fn test_open_pool_with_co_winners() {
    let t = TestEngine::new();
    let a = t.funded("alice", 100).await;
    let b = t.funded("bob", 100).await;
    let c = t.funded("carol", 100).await;
    let d = t.funded("dave", 100).await;

    let comp = t.engine.create_competition(&a, None, 10, "any%", pool_of(4)).await.unwrap();
    assert_eq!(comp.state, CompetitionState::Open);
    t.engine.join(&comp.id, &b).await.unwrap();
    t.engine.join(&comp.id, &c).await.unwrap();
    let comp = t.engine.start(&comp.id).await.unwrap();
    assert_eq!(comp.state, CompetitionState::Active);

    // Dave arrived too late to compete but may still bet.
    let err = t.engine.join(&comp.id, &d).await.unwrap_err();
    assert!(matches!(err, WagerError::InvalidState { .. }));
    t.engine.place_bet(&comp.id, &d, &c, 20).await.unwrap();

    t.leaderboard.set_ranks(
        "any%",
        &[("alice", 1, 500.0), ("bob", 1, 500.0), ("carol", 2, 900.0)],
    );
    let done = t.engine.resolve(&comp.id).await.unwrap();
    let settlement = done.settlement.clone().unwrap();
    assert_eq!(settlement.winners, vec![a.clone(), b.clone()]);
    assert!(!settlement.draw);

    // Carol's 10 GP is split 5/5.
    assert_eq!(t.balance(&a).await, 105);
    assert_eq!(t.balance(&b).await, 105);
    assert_eq!(t.balance(&c).await, 90);
    // Dave backed a loser with nobody on the winning side: the house keeps it.
    assert_eq!(t.balance(&d).await, 80);
    assert_eq!(settlement.house_retained, 20);
    assert_eq!(t.net_movement(&done).await, -20);
}

#[tokio::test]
async fn test_forfeit_refunds_everything() {
    let t = TestEngine::new();
    let a = t.funded("alice", 200).await;
    let b = t.funded("bob", 200).await;
    let c = t.funded("carol", 200).await;

    let comp = t
        .engine
        .create_competition(&a, Some(&b), 150, "any%", CompetitionMeta::default())
        .await
        .unwrap();
    t.engine.respond(&comp.id, &b, Response::Accept).await.unwrap();
    t.engine.place_bet(&comp.id, &c, &a, 75).await.unwrap();
    t.leaderboard.set_ranks("any%", &[("alice", 1, 1.0), ("bob", 2, 1.0)]);
    t.directory.remove("alice");

    let done = t.engine.resolve(&comp.id).await.unwrap();
    assert_eq!(done.state, CompetitionState::Cancelled);
    assert!(done.settlement.is_none());
    assert_eq!(t.net_movement(&done).await, 0);
    for id in [&a, &b, &c] {
        assert_eq!(t.balance(id).await, 200);
    }
}

#[tokio::test]
async fn test_terminal_competitions_reject_everything() {
    let t = TestEngine::new();
    let a = t.funded("alice", 500).await;
    let b = t.funded("bob", 500).await;
    let c = t.funded("carol", 500).await;

    let comp = t
        .engine
        .create_competition(&a, Some(&b), 100, "any%", CompetitionMeta::default())
        .await
        .unwrap();
    t.engine.respond(&comp.id, &b, Response::Decline).await.unwrap();
    let before: Vec<_> = [&a, &b, &c].iter().map(|id| (*id).clone()).collect();
    let mut balances = Vec::new();
    for id in &before {
        balances.push(t.balance(id).await);
    }

    let errs = vec![
        t.engine.respond(&comp.id, &b, Response::Accept).await.unwrap_err(),
        t.engine.join(&comp.id, &c).await.unwrap_err(),
        t.engine.start(&comp.id).await.unwrap_err(),
        t.engine.place_bet(&comp.id, &c, &a, 10).await.map(|_| ()).unwrap_err(),
        t.engine.resolve(&comp.id).await.map(|_| ()).unwrap_err(),
    ];
    for err in errs {
        assert!(
            matches!(err, WagerError::InvalidState { state: CompetitionState::Declined, .. }),
            "unexpected error: {err}"
        );
    }

    for (id, balance) in before.iter().zip(balances) {
        assert_eq!(t.balance(id).await, balance);
    }
}

#[tokio::test]
async fn test_sweep_resolves_only_expired() {
    let t = TestEngine::new();
    let a = t.funded("alice", 500).await;
    let b = t.funded("bob", 500).await;
    let c = t.funded("carol", 500).await;

    let first = t
        .engine
        .create_competition(&a, Some(&b), 100, "any%", CompetitionMeta::default())
        .await
        .unwrap();
    let first = t.engine.respond(&first.id, &b, Response::Accept).await.unwrap();

    let pending = t
        .engine
        .create_competition(&c, Some(&a), 100, "any%", CompetitionMeta::default())
        .await
        .unwrap();

    t.leaderboard.set_ranks("any%", &[("alice", 1, 1.0), ("bob", 2, 1.0)]);
    let now = first.end_at.unwrap() + Duration::seconds(1);
    let report = t.engine.sweep(now).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.completed, vec![first.id]);

    let pending = t.engine.get_competition(&pending.id).await.unwrap();
    assert_eq!(pending.state, CompetitionState::Pending);
    assert!(t.engine.sweep(Utc::now()).await.unwrap().completed.is_empty());
}

/// Rewrite a stored wager the way a hand-edited snapshot could.
async fn tamper_wager(t: &TestEngine, id: &CompetitionId, wager: Gp) {
    let stored = t.store.competition(id).await.unwrap().unwrap();
    let mut edited = stored.value.clone();
    edited.wager = wager;
    t.store.commit_competition(stored.version, edited).await.unwrap();
}

#[tokio::test]
async fn test_oversized_amounts_are_rejected_everywhere() {
    let t = TestEngine::new();
    let a = t.funded("alice", 100).await;
    let b = t.funded("bob", 0).await;
    let c = t.funded("carol", 0).await;
    let d = t.funded("dave", 0).await;

    for huge in [u64::MAX, 1 << 63] {
        let err = t
            .engine
            .create_competition(&b, Some(&c), huge, "any%", CompetitionMeta::default())
            .await
            .unwrap_err();
        assert_eq!(err, WagerError::InvalidAmount);
        let err = t
            .engine
            .create_competition(&b, None, huge, "any%", CompetitionMeta::default())
            .await
            .unwrap_err();
        assert_eq!(err, WagerError::InvalidAmount);
    }

    let duel = t
        .engine
        .create_competition(&a, Some(&b), 10, "any%", CompetitionMeta::default())
        .await
        .unwrap();
    tamper_wager(&t, &duel.id, u64::MAX).await;
    let err = t.engine.respond(&duel.id, &b, Response::Accept).await.unwrap_err();
    assert_eq!(err, WagerError::InvalidAmount);

    let open = t
        .engine
        .create_competition(&a, None, 10, "any%", CompetitionMeta::default())
        .await
        .unwrap();
    tamper_wager(&t, &open.id, 1 << 63).await;
    let err = t.engine.join(&open.id, &c).await.unwrap_err();
    assert_eq!(err, WagerError::InvalidAmount);

    let live = t
        .engine
        .create_competition(&a, None, 10, "any%", CompetitionMeta::default())
        .await
        .unwrap();
    let e = t.funded("erin", 10).await;
    t.engine.join(&live.id, &e).await.unwrap();
    for huge in [u64::MAX, 1 << 63] {
        let err = t.engine.place_bet(&live.id, &d, &a, huge).await.unwrap_err();
        assert_eq!(err, WagerError::InvalidAmount);
    }

    // Nobody without funds gained anything, and no ledger entry was written.
    for id in [&b, &c, &d] {
        assert_eq!(t.balance(id).await, 0);
        assert!(t.engine.history(id).await.unwrap().is_empty());
        assert!(t.engine.verify_account(id).await.unwrap());
    }
    assert_eq!(t.balance(&a).await, 70);
}
