//! Standings: turns a leaderboard snapshot into an ordered result.
//!
//! Participants are ordered by leaderboard rank (ascending), then score
//! (descending). Anyone missing from the snapshot did not compete and
//! ranks last. Participants sharing the best position are co-winners.

use std::cmp::Ordering;

use crate::providers::LeaderboardEntry;
use crate::types::{AccountId, Gp, Payout, Standing, WagerError};

/// Result of ranking a competition's participants.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ranked {
        standings: Vec<Standing>,
        winners: Vec<AccountId>,
    },
    /// Nobody appears on the leaderboard.
    NoContest,
}

fn compare(a: &Standing, b: &Standing) -> Ordering {
    match (a.rank, b.rank) {
        (Some(ra), Some(rb)) => ra.cmp(&rb).then_with(|| {
            let sa = a.score.unwrap_or(f64::NEG_INFINITY);
            let sb = b.score.unwrap_or(f64::NEG_INFINITY);
            sb.total_cmp(&sa)
        }),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Rank `participants` (account and leaderboard key, in join order).
/// Ties keep join order, so the earliest joiner comes first.
pub fn rank_participants(participants: &[(AccountId, String)], entries: &[LeaderboardEntry]) -> Outcome {
    let mut standings: Vec<Standing> = participants
        .iter()
        .map(|(account, key)| {
            let entry = entries.iter().find(|e| &e.participant_key == key);
            Standing {
                account: account.clone(),
                position: 0,
                rank: entry.map(|e| e.rank),
                score: entry.map(|e| e.score),
            }
        })
        .collect();

    if standings.iter().all(|s| s.rank.is_none()) {
        return Outcome::NoContest;
    }

    standings.sort_by(compare);

    let mut position = 0;
    for i in 0..standings.len() {
        if i == 0 || compare(&standings[i - 1], &standings[i]) != Ordering::Equal {
            position = i as u32 + 1;
        }
        standings[i].position = position;
    }

    let winners = standings
        .iter()
        .filter(|s| s.position == 1)
        .map(|s| s.account.clone())
        .collect();

    Outcome::Ranked { standings, winners }
}

/// Split the wager pot among `winners` (in standings order). Each winner
/// gets their own wager back plus an even share of the losers' wagers; the
/// indivisible remainder goes to the first winner.
pub fn split_wagers(
    wager: Gp,
    participant_count: usize,
    winners: &[AccountId],
) -> Result<Vec<Payout>, WagerError> {
    if winners.is_empty() {
        return Ok(Vec::new());
    }
    let losers = participant_count.saturating_sub(winners.len()) as Gp;
    let pot = wager.checked_mul(losers).ok_or(WagerError::InvalidAmount)?;
    let share = pot / winners.len() as Gp;
    let remainder = pot % winners.len() as Gp;

    winners
        .iter()
        .enumerate()
        .map(|(i, account)| {
            let extra = if i == 0 { share + remainder } else { share };
            Ok(Payout {
                account: account.clone(),
                amount: wager.checked_add(extra).ok_or(WagerError::InvalidAmount)?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, rank: u32, score: f64) -> LeaderboardEntry {
        LeaderboardEntry {
            participant_key: key.to_string(),
            rank,
            score,
        }
    }

    fn participants(keys: &[&str]) -> Vec<(AccountId, String)> {
        keys.iter().map(|k| (AccountId::new(*k), k.to_string())).collect()
    }

    fn ids(v: &[AccountId]) -> Vec<&str> {
        v.iter().map(|a| a.as_str()).collect()
    }

    #[test]
    fn test_best_rank_wins() {
        let out = rank_participants(
            &participants(&["alice", "bob"]),
            &[entry("bob", 7, 100.0), entry("alice", 3, 50.0)],
        );
        let Outcome::Ranked { standings, winners } = out else {
            panic!("expected ranked outcome");
        };
        assert_eq!(ids(&winners), vec!["alice"]);
        assert_eq!(standings[0].position, 1);
        assert_eq!(standings[1].account.as_str(), "bob");
        assert_eq!(standings[1].position, 2);
    }

    #[test]
    fn test_score_breaks_rank_tie() {
        let out = rank_participants(
            &participants(&["alice", "bob"]),
            &[entry("alice", 1, 10.0), entry("bob", 1, 12.0)],
        );
        let Outcome::Ranked { winners, .. } = out else { panic!() };
        assert_eq!(ids(&winners), vec!["bob"]);
    }

    #[test]
    fn test_exact_tie_gives_co_winners_in_join_order() {
        let out = rank_participants(
            &participants(&["carol", "alice", "bob"]),
            &[entry("alice", 1, 10.0), entry("carol", 1, 10.0), entry("bob", 2, 99.0)],
        );
        let Outcome::Ranked { standings, winners } = out else { panic!() };
        assert_eq!(ids(&winners), vec!["carol", "alice"]);
        let positions: Vec<u32> = standings.iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![1, 1, 3]);
    }

    #[test]
    fn test_missing_entry_ranks_last() {
        let out = rank_participants(&participants(&["alice", "bob"]), &[entry("bob", 40, 1.0)]);
        let Outcome::Ranked { standings, winners } = out else { panic!() };
        assert_eq!(ids(&winners), vec!["bob"]);
        assert_eq!(standings[1].rank, None);
        assert_eq!(standings[1].position, 2);
    }

    #[test]
    fn test_no_entries_is_no_contest() {
        let out = rank_participants(&participants(&["alice", "bob"]), &[entry("zed", 1, 1.0)]);
        assert_eq!(out, Outcome::NoContest);
    }

    #[test]
    fn test_split_single_winner() {
        let payouts = split_wagers(100, 2, &[AccountId::new("alice")]).unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].amount, 200);
    }

    #[test]
    fn test_split_co_winners_with_remainder() {
        // 5 participants x 10 GP, 3 co-winners: 20 GP of losers' wagers.
        let winners = vec![AccountId::new("a"), AccountId::new("b"), AccountId::new("c")];
        let payouts = split_wagers(10, 5, &winners).unwrap();
        let amounts: Vec<Gp> = payouts.iter().map(|p| p.amount).collect();
        assert_eq!(amounts, vec![10 + 6 + 2, 16, 16]);
        assert_eq!(amounts.iter().sum::<Gp>(), 50);
    }

    #[test]
    fn test_split_everyone_tied_returns_wagers() {
        let winners = vec![AccountId::new("a"), AccountId::new("b")];
        let payouts = split_wagers(25, 2, &winners).unwrap();
        assert!(payouts.iter().all(|p| p.amount == 25));
    }

    #[test]
    fn test_split_overflow_rejected() {
        let winners = vec![AccountId::new("a")];
        assert_eq!(split_wagers(u64::MAX / 2, 4, &winners).unwrap_err(), WagerError::InvalidAmount);
        assert_eq!(split_wagers(u64::MAX / 2 + 1, 2, &winners).unwrap_err(), WagerError::InvalidAmount);
    }
}
