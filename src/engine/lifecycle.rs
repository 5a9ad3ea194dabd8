//! Competition lifecycle: the state machine from creation to a terminal
//! state.
//!
//! Each command runs under a per-competition lock and writes the
//! competition back with a version check, so unrelated competitions never
//! wait on each other. Escrow and payouts go through the ledger. Closing a
//! competition is two-phase: the decided outcome is persisted first, then
//! the keyed ledger credits are issued, then the terminal state is written.
//! A close that fails half-way is finished identically by the next attempt.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use super::ledger::Ledger;
use super::pool::BettingPool;
use super::resolver::{self, Outcome};
use crate::providers::{AccountDirectory, LeaderboardSnapshot};
use crate::storage::{Store, Versioned};
use crate::types::{
    AccountId, Bet, Closing, Competition, CompetitionId, CompetitionMeta, CompetitionState,
    EntryReason, Gp, Participant, Payout, Response, Settlement, WagerError, MAX_GP,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long a competition runs once active.
    pub competition_duration: Duration,
    /// Participant cap for open competitions unless overridden at creation.
    pub default_max_participants: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            competition_duration: Duration::days(7),
            default_max_participants: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-competition serialization
// ---------------------------------------------------------------------------

/// One async mutex per competition with a command in flight. An entry is
/// dropped as soon as its last holder or waiter lets go, so the map only
/// ever holds competitions that are currently being worked on.
#[derive(Default)]
struct CompetitionLocks {
    inner: Mutex<HashMap<CompetitionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl CompetitionLocks {
    async fn acquire(&self, id: CompetitionId) -> CompetitionGuard<'_> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(id).or_default().clone()
        };
        CompetitionGuard {
            locks: self,
            id,
            guard: Some(lock.lock_owned().await),
        }
    }

    fn release(&self, id: &CompetitionId) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Clones are only taken under the map lock, so a count of one means
        // nobody holds or waits on this mutex.
        if map.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

struct CompetitionGuard<'a> {
    locks: &'a CompetitionLocks,
    id: CompetitionId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CompetitionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

pub struct CompetitionLifecycle {
    store: Arc<dyn Store>,
    ledger: Ledger,
    pool: BettingPool,
    leaderboard: Arc<dyn LeaderboardSnapshot>,
    directory: Arc<dyn AccountDirectory>,
    config: LifecycleConfig,
    locks: CompetitionLocks,
}

impl CompetitionLifecycle {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Ledger,
        pool: BettingPool,
        leaderboard: Arc<dyn LeaderboardSnapshot>,
        directory: Arc<dyn AccountDirectory>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            pool,
            leaderboard,
            directory,
            config,
            locks: CompetitionLocks::default(),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    // -- Reads -----------------------------------------------------------

    pub async fn get(&self, id: &CompetitionId) -> Result<Competition, WagerError> {
        Ok(self.load(id).await?.value)
    }

    /// All competitions in `state`, oldest first.
    pub async fn list(&self, state: CompetitionState) -> Result<Vec<Competition>, WagerError> {
        let mut found: Vec<Competition> = self
            .store
            .competitions()
            .await?
            .into_iter()
            .map(|c| c.value)
            .filter(|c| c.state == state)
            .collect();
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }

    /// Active competitions whose end time has passed at `now`.
    pub async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Competition>, WagerError> {
        Ok(self
            .list(CompetitionState::Active)
            .await?
            .into_iter()
            .filter(|c| c.is_expired(now))
            .collect())
    }

    // -- Commands --------------------------------------------------------

    /// Open a competition and escrow the creator's wager. With an opponent
    /// the competition starts `Pending`, otherwise `Open`.
    pub async fn create(
        &self,
        creator: &AccountId,
        opponent: Option<&AccountId>,
        wager: Gp,
        leaderboard_ref: &str,
        meta: CompetitionMeta,
    ) -> Result<Competition, WagerError> {
        if wager == 0 || wager > MAX_GP {
            return Err(WagerError::InvalidAmount);
        }
        self.ledger.account(creator).await?;
        if let Some(opponent) = opponent {
            self.ledger.account(opponent).await?;
        }

        let now = Utc::now();
        let id = CompetitionId::new();
        if opponent == Some(creator) {
            return Err(WagerError::AlreadyJoined {
                competition: id,
                account: creator.clone(),
            });
        }

        let (state, max_participants) = match opponent {
            Some(_) => (CompetitionState::Pending, 2),
            None => (
                CompetitionState::Open,
                meta.max_participants
                    .unwrap_or(self.config.default_max_participants)
                    .max(2),
            ),
        };

        let competition = Competition {
            id,
            creator: creator.clone(),
            opponent: opponent.cloned(),
            wager,
            leaderboard_ref: leaderboard_ref.to_string(),
            game: meta.game,
            max_participants,
            state,
            created_at: now,
            start_at: None,
            end_at: None,
            participants: vec![Participant {
                account: creator.clone(),
                joined_at: now,
                escrow_paid: true,
            }],
            bets: Vec::new(),
            settlement: None,
            closing: None,
            cancel_reason: None,
        };
        let reference = competition.reference();

        self.ledger
            .debit(creator, wager, EntryReason::WagerEscrow, &reference)
            .await?;

        match self.store.insert_competition(competition).await {
            Ok(stored) => {
                info!(
                    competition_id = %id,
                    creator = %creator,
                    opponent = ?opponent.map(|o| o.to_string()),
                    wager,
                    state = %stored.value.state,
                    "Competition created"
                );
                Ok(stored.value)
            }
            Err(e) => {
                self.compensate(creator, wager, EntryReason::WagerRefund, &reference).await;
                Err(e.into())
            }
        }
    }

    /// The invited opponent accepts or declines a `Pending` competition.
    pub async fn respond(
        &self,
        id: &CompetitionId,
        account: &AccountId,
        response: Response,
    ) -> Result<Competition, WagerError> {
        let _guard = self.locks.acquire(*id).await;
        let stored = self.load(id).await?;
        let competition = &stored.value;

        if competition.is_closing() {
            return self.finish_closing(stored).await;
        }
        competition.require_state(CompetitionState::Pending, "respond to an invitation")?;
        if competition.opponent.as_ref() != Some(account) {
            return Err(WagerError::NotInvited {
                competition: *id,
                account: account.clone(),
            });
        }

        match response {
            Response::Decline => {
                info!(competition_id = %id, opponent = %account, "Invitation declined");
                self.close(
                    stored,
                    Closing::Refund {
                        target: CompetitionState::Declined,
                        reason: format!("declined by {account}"),
                    },
                )
                .await
            }
            Response::Accept => self.accept(stored, account).await,
        }
    }

    async fn accept(
        &self,
        stored: Versioned<Competition>,
        opponent: &AccountId,
    ) -> Result<Competition, WagerError> {
        let mut competition = stored.value.clone();
        let reference = competition.reference();
        let wager = competition.wager;

        match self
            .ledger
            .debit(opponent, wager, EntryReason::WagerEscrow, &reference)
            .await
        {
            Ok(_) => {}
            Err(err @ WagerError::InsufficientFunds { .. }) => {
                warn!(
                    competition_id = %competition.id,
                    opponent = %opponent,
                    error = %err,
                    "Opponent cannot cover the wager, cancelling"
                );
                self.close(
                    stored,
                    Closing::Refund {
                        target: CompetitionState::Cancelled,
                        reason: format!("{opponent} could not cover the wager"),
                    },
                )
                .await?;
                return Err(err);
            }
            Err(e) => return Err(e),
        }

        competition.participants.push(Participant {
            account: opponent.clone(),
            joined_at: Utc::now(),
            escrow_paid: true,
        });
        self.activate(&mut competition)?;

        match self.save(stored.version, competition).await {
            Ok(saved) => {
                info!(
                    competition_id = %saved.id,
                    opponent = %opponent,
                    end_at = ?saved.end_at,
                    "Invitation accepted, competition active"
                );
                Ok(saved)
            }
            Err(e) => {
                self.compensate(opponent, wager, EntryReason::WagerRefund, &reference).await;
                Err(e)
            }
        }
    }

    /// Join an open competition, escrowing the wager. The join that fills
    /// the participant cap activates the competition.
    pub async fn join(&self, id: &CompetitionId, account: &AccountId) -> Result<Competition, WagerError> {
        let _guard = self.locks.acquire(*id).await;
        let stored = self.load(id).await?;
        let mut competition = stored.value.clone();

        if competition.is_participant(account) {
            return Err(WagerError::AlreadyJoined {
                competition: *id,
                account: account.clone(),
            });
        }
        if competition.state != CompetitionState::Open {
            // A pool that filled up is reported as full until it closes.
            if competition.state == CompetitionState::Active
                && competition.is_open()
                && competition.is_full()
            {
                return Err(WagerError::CompetitionFull {
                    competition: *id,
                    cap: competition.max_participants,
                });
            }
            return Err(WagerError::InvalidState {
                competition: *id,
                state: competition.state,
                action: "join",
            });
        }
        if competition.is_full() {
            return Err(WagerError::CompetitionFull {
                competition: *id,
                cap: competition.max_participants,
            });
        }

        let reference = competition.reference();
        let wager = competition.wager;
        self.ledger
            .debit(account, wager, EntryReason::WagerEscrow, &reference)
            .await?;

        competition.participants.push(Participant {
            account: account.clone(),
            joined_at: Utc::now(),
            escrow_paid: true,
        });
        if competition.is_full() {
            self.activate(&mut competition)?;
        }

        match self.save(stored.version, competition).await {
            Ok(saved) => {
                info!(
                    competition_id = %saved.id,
                    account = %account,
                    participants = saved.participants.len(),
                    state = %saved.state,
                    "Participant joined"
                );
                Ok(saved)
            }
            Err(e) => {
                self.compensate(account, wager, EntryReason::WagerRefund, &reference).await;
                Err(e)
            }
        }
    }

    /// Start an open competition before its cap is reached. Needs at least
    /// two participants.
    pub async fn start(&self, id: &CompetitionId) -> Result<Competition, WagerError> {
        let _guard = self.locks.acquire(*id).await;
        let stored = self.load(id).await?;
        let mut competition = stored.value.clone();

        competition.require_state(CompetitionState::Open, "start")?;
        if competition.participants.len() < 2 {
            return Err(WagerError::InvalidState {
                competition: *id,
                state: competition.state,
                action: "start without an opponent",
            });
        }
        self.activate(&mut competition)?;

        let saved = self.save(stored.version, competition).await?;
        info!(
            competition_id = %saved.id,
            participants = saved.participants.len(),
            end_at = ?saved.end_at,
            "Open competition started"
        );
        Ok(saved)
    }

    /// Place a side bet on an active competition.
    pub async fn place_bet(
        &self,
        id: &CompetitionId,
        bettor: &AccountId,
        target: &AccountId,
        amount: Gp,
    ) -> Result<Bet, WagerError> {
        let _guard = self.locks.acquire(*id).await;
        let stored = self.load(id).await?;
        let mut competition = stored.value.clone();
        let reference = competition.reference();

        let bet = self.pool.place_bet(&mut competition, bettor, target, amount).await?;

        if let Err(e) = self.save(stored.version, competition).await {
            self.compensate(bettor, amount, EntryReason::BetRefund, &reference).await;
            return Err(e);
        }
        Ok(bet)
    }

    /// Resolve an active competition now. Completed competitions return
    /// their stored result without touching the ledger.
    pub async fn resolve(&self, id: &CompetitionId) -> Result<Competition, WagerError> {
        self.resolve_inner(id, None).await
    }

    /// Resolve only if the competition's end time has passed at `now`.
    pub async fn resolve_expired(
        &self,
        id: &CompetitionId,
        now: DateTime<Utc>,
    ) -> Result<Competition, WagerError> {
        self.resolve_inner(id, Some(now)).await
    }

    async fn resolve_inner(
        &self,
        id: &CompetitionId,
        expiry_check: Option<DateTime<Utc>>,
    ) -> Result<Competition, WagerError> {
        let _guard = self.locks.acquire(*id).await;
        let stored = self.load(id).await?;
        let competition = &stored.value;

        if competition.state == CompetitionState::Completed {
            debug!(competition_id = %id, "Already settled, returning stored result");
            return Ok(stored.value);
        }
        competition.require_state(CompetitionState::Active, "resolve")?;
        if competition.is_closing() {
            return self.finish_closing(stored).await;
        }
        if let Some(now) = expiry_check {
            if !competition.is_expired(now) {
                return Err(WagerError::InvalidState {
                    competition: *id,
                    state: competition.state,
                    action: "resolve before its end time",
                });
            }
        }

        // External lookups happen before any ledger movement.
        let mut keyed = Vec::with_capacity(competition.participants.len());
        let mut forfeited = None;
        for participant in &competition.participants {
            let account = self.ledger.account(&participant.account).await?;
            let resolved = self
                .directory
                .resolve(&account.player_key)
                .await
                .map_err(|e| WagerError::ExternalLookupFailed {
                    collaborator: "account directory",
                    message: format!("{e:#}"),
                })?;

            if resolved.as_ref() != Some(&participant.account) {
                warn!(
                    competition_id = %id,
                    account = %participant.account,
                    player_key = %account.player_key,
                    "Participant no longer resolvable, forfeiting competition"
                );
                forfeited = Some(participant.account.clone());
                break;
            }
            keyed.push((participant.account.clone(), account.player_key));
        }
        if let Some(account) = forfeited {
            return self
                .close(
                    stored,
                    Closing::Refund {
                        target: CompetitionState::Cancelled,
                        reason: format!("{account} is no longer resolvable"),
                    },
                )
                .await;
        }

        let entries = self
            .leaderboard
            .get_entries(&competition.leaderboard_ref)
            .await
            .map_err(|e| WagerError::ExternalLookupFailed {
                collaborator: "leaderboard",
                message: format!("{e:#}"),
            })?;

        match resolver::rank_participants(&keyed, &entries) {
            Outcome::NoContest => {
                warn!(competition_id = %id, "No participant on the leaderboard, cancelling");
                self.close(
                    stored,
                    Closing::Refund {
                        target: CompetitionState::Cancelled,
                        reason: "no participant appears on the leaderboard".to_string(),
                    },
                )
                .await
            }
            Outcome::Ranked { standings, winners } => {
                let mut competition = stored.value.clone();
                let draw = winners.len() == competition.participants.len();
                let wager_payouts =
                    resolver::split_wagers(competition.wager, competition.participants.len(), &winners)?;

                let (bet_payouts, house_bonus, house_retained) = if draw {
                    let refunds = competition
                        .bets
                        .iter()
                        .map(|b| Payout {
                            account: b.bettor.clone(),
                            amount: b.amount,
                        })
                        .collect();
                    (refunds, 0, 0)
                } else {
                    let pool = self.pool.compute(&competition.bets, &winners)?;
                    (pool.as_payouts(), pool.house_bonus, pool.house_retained)
                };

                competition.settlement = Some(Settlement {
                    standings,
                    winners,
                    draw,
                    wager_payouts,
                    bet_payouts,
                    house_bonus,
                    house_retained,
                    settled_at: Utc::now(),
                });
                let stored = Versioned {
                    version: stored.version,
                    value: competition,
                };
                self.close(stored, Closing::Settle).await
            }
        }
    }

    // -- Closing ---------------------------------------------------------

    /// Persist the closing decision, then carry it out.
    async fn close(
        &self,
        stored: Versioned<Competition>,
        closing: Closing,
    ) -> Result<Competition, WagerError> {
        let mut competition = stored.value;
        let target = match &closing {
            Closing::Settle => CompetitionState::Completed,
            Closing::Refund { target, .. } => *target,
        };
        if !competition.state.can_transition_to(target) {
            return Err(WagerError::InvalidState {
                competition: competition.id,
                state: competition.state,
                action: "close",
            });
        }

        competition.closing = Some(closing);
        let version = stored.version;
        let saved = self
            .store
            .commit_competition(version, competition)
            .await
            .map_err(WagerError::from)?;
        self.finish_closing(saved).await
    }

    /// Issue the ledger movements for a decided close and write the
    /// terminal state. Every credit is keyed, so this is safe to repeat.
    async fn finish_closing(&self, stored: Versioned<Competition>) -> Result<Competition, WagerError> {
        let mut competition = stored.value;
        let reference = competition.reference();
        let id = competition.id;

        let Some(closing) = competition.closing.clone() else {
            return Ok(competition);
        };

        match closing {
            Closing::Settle => {
                let settlement = competition.settlement.clone().ok_or_else(|| {
                    WagerError::Storage(format!("competition {id} is settling without a result"))
                })?;
                let reason = if settlement.draw {
                    EntryReason::WagerRefund
                } else {
                    EntryReason::WagerPayout
                };
                for payout in &settlement.wager_payouts {
                    self.ledger
                        .credit_once(
                            &payout.account,
                            payout.amount,
                            reason,
                            &reference,
                            format!("wager-payout:{id}:{}", payout.account),
                        )
                        .await?;
                }
                if settlement.draw {
                    self.pool.refund_all(&mut competition).await?;
                } else {
                    self.pool.settle(&mut competition, &settlement.winners).await?;
                }
                for participant in competition.participants.iter_mut() {
                    participant.escrow_paid = false;
                }
                competition.transition(CompetitionState::Completed, "settle")?;
            }
            Closing::Refund { target, reason } => {
                self.refund_wagers(&mut competition).await?;
                self.pool.refund_all(&mut competition).await?;
                competition.cancel_reason = Some(reason);
                competition.transition(target, "refund")?;
            }
        }
        competition.closing = None;

        let saved = self.save(stored.version, competition).await?;
        match saved.state {
            CompetitionState::Completed => {
                let settlement = saved.settlement.as_ref();
                info!(
                    competition_id = %id,
                    winners = ?settlement.map(|s| s.winners.iter().map(|w| w.to_string()).collect::<Vec<_>>()),
                    draw = settlement.is_some_and(|s| s.draw),
                    house_bonus = settlement.map_or(0, |s| s.house_bonus),
                    house_retained = settlement.map_or(0, |s| s.house_retained),
                    "Competition completed"
                );
            }
            state => {
                info!(
                    competition_id = %id,
                    state = %state,
                    reason = ?saved.cancel_reason,
                    "Competition closed with refunds"
                );
            }
        }
        Ok(saved)
    }

    async fn refund_wagers(&self, competition: &mut Competition) -> Result<(), WagerError> {
        let reference = competition.reference();
        let id = competition.id;
        let wager = competition.wager;
        for participant in competition.participants.iter_mut().filter(|p| p.escrow_paid) {
            self.ledger
                .credit_once(
                    &participant.account,
                    wager,
                    EntryReason::WagerRefund,
                    &reference,
                    format!("wager-refund:{id}:{}", participant.account),
                )
                .await?;
            participant.escrow_paid = false;
        }
        Ok(())
    }

    // -- Helpers ---------------------------------------------------------

    fn activate(&self, competition: &mut Competition) -> Result<(), WagerError> {
        competition.transition(CompetitionState::Active, "activate")?;
        let start = Utc::now();
        competition.start_at = Some(start);
        competition.end_at = Some(start + self.config.competition_duration);
        Ok(())
    }

    async fn load(&self, id: &CompetitionId) -> Result<Versioned<Competition>, WagerError> {
        self.store
            .competition(id)
            .await?
            .ok_or_else(|| WagerError::competition_not_found(id))
    }

    async fn save(&self, expected_version: u64, competition: Competition) -> Result<Competition, WagerError> {
        Ok(self
            .store
            .commit_competition(expected_version, competition)
            .await?
            .value)
    }

    /// Return an escrow taken by a command whose competition write failed.
    async fn compensate(&self, account: &AccountId, amount: Gp, reason: EntryReason, reference: &str) {
        if let Err(e) = self.ledger.credit(account, amount, reason, reference).await {
            error!(
                account = %account,
                amount,
                reference,
                error = %e,
                "Failed to return escrow after aborted command"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
