//! Betting pool: side bets on a running competition.
//!
//! Bets are escrowed through the ledger when placed. At settlement the
//! pool splits stakes into the side that backed a winner and the side that
//! did not, then pays the winning side either a proportional share of the
//! losing pot or, if nobody bet against them, the house guarantee bonus.

use chrono::Utc;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use tracing::{debug, info};
use uuid::Uuid;

use super::ledger::Ledger;
use crate::types::{
    AccountId, Bet, Competition, CompetitionState, EntryReason, Gp, Payout, WagerError, MAX_GP,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Bonus paid by the house to an unopposed winning bettor, as a
    /// fraction of their stake (floored to whole GP).
    pub house_guarantee_rate: Decimal,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            house_guarantee_rate: dec!(0.5),
        }
    }
}

// ---------------------------------------------------------------------------
// Settlement computation
// ---------------------------------------------------------------------------

/// What one bet pays out at settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BetPayout {
    pub bet_id: Uuid,
    pub bettor: AccountId,
    pub stake: Gp,
    /// Proportional share of the losing pot.
    pub share: Gp,
    /// House guarantee bonus.
    pub bonus: Gp,
}

impl BetPayout {
    /// Single credit issued to the bettor: stake back plus winnings.
    pub fn total(&self) -> Gp {
        self.stake + self.share + self.bonus
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PoolSettlement {
    pub payouts: Vec<BetPayout>,
    pub winning_stake: Gp,
    pub losing_stake: Gp,
    pub house_bonus: Gp,
    /// Losing stakes not distributed: the whole losing pot when nobody
    /// backed a winner, otherwise the flooring remainder.
    pub house_retained: Gp,
}

impl PoolSettlement {
    pub fn total_paid(&self) -> Gp {
        self.payouts.iter().map(BetPayout::total).sum()
    }

    pub fn as_payouts(&self) -> Vec<Payout> {
        self.payouts
            .iter()
            .map(|p| Payout {
                account: p.bettor.clone(),
                amount: p.total(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BettingPool {
    ledger: Ledger,
    config: PoolConfig,
}

impl BettingPool {
    pub fn new(ledger: Ledger, config: PoolConfig) -> Self {
        Self { ledger, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check whether `bettor` may back `target` with `amount`.
    pub fn validate_bet(
        competition: &Competition,
        bettor: &AccountId,
        target: &AccountId,
        amount: Gp,
    ) -> Result<(), WagerError> {
        if amount == 0 || amount > MAX_GP {
            return Err(WagerError::InvalidAmount);
        }
        competition.require_state(CompetitionState::Active, "place a bet")?;
        if competition.is_closing() {
            return Err(WagerError::InvalidState {
                competition: competition.id,
                state: competition.state,
                action: "place a bet while it is being closed",
            });
        }
        if competition.is_participant(bettor) {
            return Err(WagerError::SelfBet {
                competition: competition.id,
                bettor: bettor.clone(),
            });
        }
        if competition.bet_by(bettor).is_some() {
            return Err(WagerError::DuplicateBet {
                competition: competition.id,
                bettor: bettor.clone(),
            });
        }
        if !competition.is_participant(target) {
            return Err(WagerError::NotParticipant {
                competition: competition.id,
                account: target.clone(),
            });
        }
        Ok(())
    }

    /// Escrow the stake and record the bet on `competition`. The caller
    /// persists the competition.
    pub async fn place_bet(
        &self,
        competition: &mut Competition,
        bettor: &AccountId,
        target: &AccountId,
        amount: Gp,
    ) -> Result<Bet, WagerError> {
        Self::validate_bet(competition, bettor, target, amount)?;

        self.ledger
            .debit(bettor, amount, EntryReason::BetEscrow, &competition.reference())
            .await?;

        let bet = Bet {
            id: Uuid::new_v4(),
            bettor: bettor.clone(),
            target: target.clone(),
            amount,
            placed_at: Utc::now(),
            paid: false,
        };
        competition.bets.push(bet.clone());

        info!(
            competition_id = %competition.id,
            bettor = %bettor,
            target = %target,
            amount,
            "Bet placed"
        );
        Ok(bet)
    }

    /// Work out every bet's payout. Pure and deterministic: the same bets
    /// and winners always yield the same amounts. Fails with
    /// `InvalidAmount` if the stakes overflow.
    pub fn compute(&self, bets: &[Bet], winners: &[AccountId]) -> Result<PoolSettlement, WagerError> {
        let (winning, losing): (Vec<&Bet>, Vec<&Bet>) =
            bets.iter().partition(|b| winners.contains(&b.target));

        let winning_stake = total_stake(&winning)?;
        let losing_stake = total_stake(&losing)?;

        let mut settlement = PoolSettlement {
            winning_stake,
            losing_stake,
            ..Default::default()
        };

        if winning.is_empty() {
            settlement.house_retained = losing_stake;
            return Ok(settlement);
        }

        if losing.is_empty() {
            for bet in winning {
                let bonus = (Decimal::from(bet.amount) * self.config.house_guarantee_rate)
                    .floor()
                    .to_u64()
                    .unwrap_or(0);
                settlement.house_bonus = settlement
                    .house_bonus
                    .checked_add(bonus)
                    .ok_or(WagerError::InvalidAmount)?;
                settlement.payouts.push(BetPayout {
                    bet_id: bet.id,
                    bettor: bet.bettor.clone(),
                    stake: bet.amount,
                    share: 0,
                    bonus,
                });
            }
            return Ok(settlement);
        }

        let mut distributed: Gp = 0;
        for bet in winning {
            // floored shares sum to at most losing_stake
            let share = (bet.amount as u128 * losing_stake as u128 / winning_stake as u128) as Gp;
            distributed += share;
            settlement.payouts.push(BetPayout {
                bet_id: bet.id,
                bettor: bet.bettor.clone(),
                stake: bet.amount,
                share,
                bonus: 0,
            });
        }
        settlement.house_retained = losing_stake - distributed;
        Ok(settlement)
    }

    /// Compute payouts and credit each winning bettor once. Every bet is
    /// marked paid. Credits are keyed per bet, so re-running a settlement
    /// that failed half-way does not pay anyone twice.
    pub async fn settle(
        &self,
        competition: &mut Competition,
        winners: &[AccountId],
    ) -> Result<PoolSettlement, WagerError> {
        let settlement = self.compute(&competition.bets, winners)?;
        let reference = competition.reference();

        for payout in &settlement.payouts {
            self.ledger
                .credit_once(
                    &payout.bettor,
                    payout.total(),
                    EntryReason::BetPayout,
                    &reference,
                    format!("bet-payout:{}:{}", competition.id, payout.bet_id),
                )
                .await?;
        }
        for bet in competition.bets.iter_mut() {
            bet.paid = true;
        }

        info!(
            competition_id = %competition.id,
            bets = competition.bets.len(),
            winning_stake = settlement.winning_stake,
            losing_stake = settlement.losing_stake,
            paid = settlement.total_paid(),
            house_bonus = settlement.house_bonus,
            house_retained = settlement.house_retained,
            "Betting pool settled"
        );
        Ok(settlement)
    }

    /// Return every unpaid stake in full. Returns the amount refunded.
    pub async fn refund_all(&self, competition: &mut Competition) -> Result<Gp, WagerError> {
        let reference = competition.reference();
        let mut refunded: Gp = 0;
        for bet in competition.bets.iter_mut().filter(|b| !b.paid) {
            self.ledger
                .credit_once(
                    &bet.bettor,
                    bet.amount,
                    EntryReason::BetRefund,
                    &reference,
                    format!("bet-refund:{}:{}", competition.id, bet.id),
                )
                .await?;
            bet.paid = true;
            refunded = refunded.checked_add(bet.amount).ok_or(WagerError::InvalidAmount)?;
            debug!(competition_id = %competition.id, bettor = %bet.bettor, amount = bet.amount, "Bet refunded");
        }
        Ok(refunded)
    }
}

fn total_stake(bets: &[&Bet]) -> Result<Gp, WagerError> {
    bets.iter()
        .try_fold(0 as Gp, |acc, b| acc.checked_add(b.amount))
        .ok_or(WagerError::InvalidAmount)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
