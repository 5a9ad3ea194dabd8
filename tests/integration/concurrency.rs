//! Racing commands against shared accounts and competitions.

use futures::future::join_all;

use wagerbook::engine::EngineConfig;
use wagerbook::types::{
    CompetitionMeta, CompetitionState, EntryReason, GrantPeriod, Response, WagerError,
};

use crate::harness::TestEngine;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_bets_never_overdraw() {
    let t = TestEngine::new();
    let bettor = t.funded("bettor", 100).await;

    // Three duels, one bettor who can only afford one 60 GP bet.
    let mut competitions = Vec::new();
    for i in 0..3 {
        let a = t.funded(&format!("a{i}"), 100).await;
        let b = t.funded(&format!("b{i}"), 100).await;
        let c = t
            .engine
            .create_competition(&a, Some(&b), 10, "any%", CompetitionMeta::default())
            .await
            .unwrap();
        t.engine.respond(&c.id, &b, Response::Accept).await.unwrap();
        competitions.push((c.id, a));
    }

    let handles: Vec<_> = competitions
        .into_iter()
        .map(|(id, target)| {
            let engine = t.engine.clone();
            let bettor = bettor.clone();
            tokio::spawn(async move { engine.place_bet(&id, &bettor, &target, 60).await })
        })
        .collect();

    let mut placed = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => placed += 1,
            Err(e) => assert!(matches!(e, WagerError::InsufficientFunds { .. }), "{e}"),
        }
    }
    assert_eq!(placed, 1);
    assert_eq!(t.balance(&bettor).await, 40);
    assert!(t.engine.verify_account(&bettor).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_grants_credit_once() {
    let t = TestEngine::with_config(EngineConfig {
        stipend: 100,
        ..EngineConfig::default()
    });
    let mut accounts = Vec::new();
    for i in 0..20 {
        accounts.push(t.funded(&format!("player{i}"), 0).await);
    }
    let period = GrantPeriod::new("2025-03");

    // The schedule and a manual trigger firing together, several times.
    let reports = join_all((0..6).map(|_| {
        let engine = t.engine.clone();
        let period = period.clone();
        async move { engine.run_periodic_grant(&period).await.unwrap() }
    }))
    .await;

    let issued: u64 = reports.iter().map(|r| r.total_issued).sum();
    assert_eq!(issued, 2_000);
    for id in &accounts {
        assert_eq!(t.balance(id).await, 100);
        let stipends = t
            .engine
            .history(id)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.reason == EntryReason::Stipend)
            .count();
        assert_eq!(stipends, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_joins_respect_cap() {
    let t = TestEngine::new();
    let creator = t.funded("creator", 100).await;
    let comp = t
        .engine
        .create_competition(
            &creator,
            None,
            25,
            "any%",
            CompetitionMeta {
                game: "Celeste".to_string(),
                max_participants: Some(3),
            },
        )
        .await
        .unwrap();

    let mut joiners = Vec::new();
    for i in 0..6 {
        joiners.push(t.funded(&format!("joiner{i}"), 100).await);
    }

    let handles: Vec<_> = joiners
        .iter()
        .cloned()
        .map(|id| {
            let engine = t.engine.clone();
            let comp_id = comp.id;
            tokio::spawn(async move { engine.join(&comp_id, &id).await })
        })
        .collect();

    let mut joined = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => joined += 1,
            Err(e) => assert!(matches!(e, WagerError::CompetitionFull { cap: 3, .. }), "{e}"),
        }
    }
    assert_eq!(joined, 2);

    let comp = t.engine.get_competition(&comp.id).await.unwrap();
    assert_eq!(comp.state, CompetitionState::Active);
    assert_eq!(comp.participants.len(), 3);

    // Only the accepted joiners paid.
    let mut paid = 0;
    for id in &joiners {
        if t.balance(id).await == 75 {
            paid += 1;
        } else {
            assert_eq!(t.balance(id).await, 100);
        }
    }
    assert_eq!(paid, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_resolves_settle_once() {
    let t = TestEngine::new();
    let a = t.funded("alice", 500).await;
    let b = t.funded("bob", 500).await;
    let c = t.funded("carol", 100).await;
    let d = t.funded("dave", 100).await;

    let comp = t
        .engine
        .create_competition(&a, Some(&b), 100, "any%", CompetitionMeta::default())
        .await
        .unwrap();
    t.engine.respond(&comp.id, &b, Response::Accept).await.unwrap();
    t.engine.place_bet(&comp.id, &c, &a, 50).await.unwrap();
    t.engine.place_bet(&comp.id, &d, &b, 30).await.unwrap();
    t.leaderboard.set_ranks("any%", &[("alice", 1, 1.0), ("bob", 2, 1.0)]);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = t.engine.clone();
            let id = comp.id;
            tokio::spawn(async move { engine.resolve(&id).await })
        })
        .collect();

    let mut settlements = Vec::new();
    for h in handles {
        let done = h.await.unwrap().unwrap();
        assert_eq!(done.state, CompetitionState::Completed);
        settlements.push(done.settlement);
    }
    assert!(settlements.windows(2).all(|w| w[0] == w[1]));

    assert_eq!(t.balance(&a).await, 600);
    assert_eq!(t.balance(&c).await, 130);
    let done = t.engine.get_competition(&comp.id).await.unwrap();
    assert_eq!(t.net_movement(&done).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unrelated_competitions_progress_together() {
    let t = TestEngine::new();
    let mut ids = Vec::new();
    for i in 0..10 {
        let a = t.funded(&format!("left{i}"), 100).await;
        let b = t.funded(&format!("right{i}"), 100).await;
        let c = t
            .engine
            .create_competition(&a, Some(&b), 50, &format!("board{i}"), CompetitionMeta::default())
            .await
            .unwrap();
        ids.push((c.id, b));
    }

    let accepted = join_all(ids.iter().map(|(id, b)| {
        let engine = t.engine.clone();
        async move { engine.respond(id, b, Response::Accept).await }
    }))
    .await;

    assert!(accepted.iter().all(|r| r.as_ref().is_ok_and(|c| c.state == CompetitionState::Active)));
    assert_eq!(t.engine.list_active().await.unwrap().len(), 10);
}
