//! Shared types for the WAGERBOOK engine.
//!
//! These types form the data model used across all modules: accounts and
//! their ledger entries, competitions with their participants and bets,
//! and the error taxonomy every mutating operation reports through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Amounts of GP, the virtual currency. Balances never go negative.
pub type Gp = u64;

/// Largest amount a single ledger movement may carry. Entries store signed
/// amounts, so anything above `i64::MAX` is rejected as invalid.
pub const MAX_GP: Gp = i64::MAX as Gp;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Internal account identifier, as handed out by the account directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompetitionId(pub Uuid);

impl CompetitionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CompetitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CompetitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CompetitionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Marker for a grant period, e.g. `2025-03` for a monthly cadence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantPeriod(pub String);

impl GrantPeriod {
    pub fn new(period: impl Into<String>) -> Self {
        Self(period.into())
    }
}

impl fmt::Display for GrantPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Accounts & ledger
// ---------------------------------------------------------------------------

/// A GP account. `balance` is a cached projection of the account's ledger
/// entries and is only ever written together with a new entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Identity of this account on the external leaderboard.
    pub player_key: String,
    pub balance: Gp,
    pub last_grant_period: Option<GrantPeriod>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, player_key: impl Into<String>) -> Self {
        Self {
            id,
            player_key: player_key.into(),
            balance: 0,
            last_grant_period: None,
            created_at: Utc::now(),
        }
    }
}

/// Why a ledger entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryReason {
    Stipend,
    WagerEscrow,
    WagerRefund,
    WagerPayout,
    BetEscrow,
    BetRefund,
    BetPayout,
}

impl fmt::Display for EntryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryReason::Stipend => "stipend",
            EntryReason::WagerEscrow => "wager_escrow",
            EntryReason::WagerRefund => "wager_refund",
            EntryReason::WagerPayout => "wager_payout",
            EntryReason::BetEscrow => "bet_escrow",
            EntryReason::BetRefund => "bet_refund",
            EntryReason::BetPayout => "bet_payout",
        };
        write!(f, "{s}")
    }
}

/// One immutable currency movement. Corrections are new offsetting entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Sequence number assigned by the store on append.
    pub seq: u64,
    pub account: AccountId,
    /// Positive for credits, negative for debits.
    pub amount: i64,
    pub reason: EntryReason,
    /// Competition (or grant period) this movement belongs to.
    pub reference: String,
    /// At most one entry per account may carry a given key.
    pub idempotency_key: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn is_credit(&self) -> bool {
        self.amount > 0
    }
}

impl fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.amount >= 0 { "+" } else { "" };
        write!(
            f,
            "#{} {} {sign}{} GP ({}) [{}]",
            self.seq, self.account, self.amount, self.reason, self.reference,
        )
    }
}

// ---------------------------------------------------------------------------
// Competitions
// ---------------------------------------------------------------------------

/// Lifecycle state of a competition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompetitionState {
    /// No fixed opponent; awaiting participants.
    Open,
    /// Fixed opponent invited; awaiting accept/decline.
    Pending,
    /// Escrow complete, competition running.
    Active,
    Completed,
    Declined,
    Cancelled,
}

impl CompetitionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CompetitionState::Completed | CompetitionState::Declined | CompetitionState::Cancelled
        )
    }

    /// The full transition table. Anything not listed here is illegal.
    pub fn can_transition_to(&self, next: CompetitionState) -> bool {
        use CompetitionState::*;
        matches!(
            (self, next),
            (Open, Active)
                | (Pending, Active)
                | (Pending, Declined)
                | (Pending, Cancelled)
                | (Active, Completed)
                | (Active, Cancelled)
        )
    }
}

impl fmt::Display for CompetitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompetitionState::Open => "Open",
            CompetitionState::Pending => "Pending",
            CompetitionState::Active => "Active",
            CompetitionState::Completed => "Completed",
            CompetitionState::Declined => "Declined",
            CompetitionState::Cancelled => "Cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub account: AccountId,
    pub joined_at: DateTime<Utc>,
    /// True while this participant's wager is held in escrow.
    pub escrow_paid: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bet {
    pub id: Uuid,
    pub bettor: AccountId,
    /// Participant this bet backs.
    pub target: AccountId,
    pub amount: Gp,
    pub placed_at: DateTime<Utc>,
    /// Set once the bet has been paid out or refunded.
    pub paid: bool,
}

/// Free-form details supplied at creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompetitionMeta {
    /// Game title shown alongside the leaderboard.
    pub game: String,
    /// Overrides the configured participant cap for open competitions.
    pub max_participants: Option<u32>,
}

/// One participant's final position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standing {
    pub account: AccountId,
    /// 1-based position after ordering; co-winners share position 1.
    pub position: u32,
    /// Leaderboard rank, absent if the participant did not compete.
    pub rank: Option<u32>,
    pub score: Option<f64>,
}

/// A single settlement credit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub account: AccountId,
    pub amount: Gp,
}

/// How a competition is being closed. Written before any closing ledger
/// movement so an interrupted close is finished the same way on retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Closing {
    /// Pay out the stored `settlement`.
    Settle,
    /// Refund every escrow, then move to `target` (Declined or Cancelled).
    Refund {
        target: CompetitionState,
        reason: String,
    },
}

/// Stored result of a completed competition. Repeated resolution returns
/// this value instead of settling again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub standings: Vec<Standing>,
    pub winners: Vec<AccountId>,
    /// Every participant tied; wagers and bets were returned.
    pub draw: bool,
    pub wager_payouts: Vec<Payout>,
    pub bet_payouts: Vec<Payout>,
    /// Bonus minted for unopposed winning bettors.
    pub house_bonus: Gp,
    /// Stakes kept by the house: unbacked losing bets and flooring remainders.
    pub house_retained: Gp,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competition {
    pub id: CompetitionId,
    pub creator: AccountId,
    /// Absent for open competitions.
    pub opponent: Option<AccountId>,
    /// Wager paid by each participant.
    pub wager: Gp,
    pub leaderboard_ref: String,
    pub game: String,
    pub max_participants: u32,
    pub state: CompetitionState,
    pub created_at: DateTime<Utc>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub participants: Vec<Participant>,
    pub bets: Vec<Bet>,
    pub settlement: Option<Settlement>,
    /// Decided outcome while the close is in progress.
    pub closing: Option<Closing>,
    pub cancel_reason: Option<String>,
}

impl Competition {
    /// Ledger reference shared by every entry belonging to this competition.
    pub fn reference(&self) -> String {
        format!("competition:{}", self.id)
    }

    pub fn is_open(&self) -> bool {
        self.opponent.is_none()
    }

    pub fn is_participant(&self, account: &AccountId) -> bool {
        self.participants.iter().any(|p| &p.account == account)
    }

    pub fn bet_by(&self, bettor: &AccountId) -> Option<&Bet> {
        self.bets.iter().find(|b| &b.bettor == bettor)
    }

    /// A closing outcome has been decided but not yet finished.
    pub fn is_closing(&self) -> bool {
        self.closing.is_some()
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() as u32 >= self.max_participants
    }

    /// Whether automatic resolution may fire at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == CompetitionState::Active && self.end_at.is_some_and(|end| end <= now)
    }

    /// Sum of wagers currently held in escrow.
    pub fn escrowed_wagers(&self) -> Gp {
        self.participants
            .iter()
            .filter(|p| p.escrow_paid)
            .map(|_| self.wager)
            .sum()
    }

    /// Sum of bet stakes not yet paid out or refunded.
    pub fn escrowed_bets(&self) -> Gp {
        self.bets.iter().filter(|b| !b.paid).map(|b| b.amount).sum()
    }

    /// Move to `next`, rejecting anything outside the transition table.
    pub fn transition(&mut self, next: CompetitionState, action: &'static str) -> Result<(), WagerError> {
        if !self.state.can_transition_to(next) {
            return Err(WagerError::InvalidState {
                competition: self.id,
                state: self.state,
                action,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Fail with `InvalidState` unless the competition is in `expected`.
    pub fn require_state(&self, expected: CompetitionState, action: &'static str) -> Result<(), WagerError> {
        if self.state != expected {
            return Err(WagerError::InvalidState {
                competition: self.id,
                state: self.state,
                action,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Competition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opponent = self
            .opponent
            .as_ref()
            .map(|o| o.to_string())
            .unwrap_or_else(|| "open".to_string());
        write!(
            f,
            "[{}] {} vs {} | {} | wager={} GP | participants={} bets={}",
            self.state,
            self.creator,
            opponent,
            self.leaderboard_ref,
            self.wager,
            self.participants.len(),
            self.bets.len(),
        )
    }
}

/// An invited opponent's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Accept,
    Decline,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Every failure a mutating engine call can report. All of them leave
/// balances unchanged and may be retried or shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WagerError {
    #[error("Insufficient funds in {account}: need {needed} GP, have {available} GP")]
    InsufficientFunds {
        account: AccountId,
        needed: Gp,
        available: Gp,
    },

    #[error("Competition {competition} is {state}; cannot {action}")]
    InvalidState {
        competition: CompetitionId,
        state: CompetitionState,
        action: &'static str,
    },

    #[error("{bettor} already has a bet on competition {competition}")]
    DuplicateBet {
        competition: CompetitionId,
        bettor: AccountId,
    },

    #[error("{bettor} competes in {competition} and cannot bet on it")]
    SelfBet {
        competition: CompetitionId,
        bettor: AccountId,
    },

    #[error("Competition {competition} is full ({cap} participants)")]
    CompetitionFull { competition: CompetitionId, cap: u32 },

    #[error("{account} already takes part in competition {competition}")]
    AlreadyJoined {
        competition: CompetitionId,
        account: AccountId,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("External lookup failed ({collaborator}): {message}")]
    ExternalLookupFailed {
        collaborator: &'static str,
        message: String,
    },

    #[error("Amount must be greater than zero and fit in a ledger entry")]
    InvalidAmount,

    #[error("{account} was not invited to competition {competition}")]
    NotInvited {
        competition: CompetitionId,
        account: AccountId,
    },

    #[error("{account} is not a participant of competition {competition}")]
    NotParticipant {
        competition: CompetitionId,
        account: AccountId,
    },

    #[error("Concurrent update on {entity} after {attempts} attempts; retry")]
    Conflict { entity: String, attempts: u32 },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl WagerError {
    pub fn account_not_found(id: &AccountId) -> Self {
        WagerError::NotFound {
            kind: "account",
            id: id.to_string(),
        }
    }

    pub fn competition_not_found(id: &CompetitionId) -> Self {
        WagerError::NotFound {
            kind: "competition",
            id: id.to_string(),
        }
    }

    /// Whether the same call may succeed if simply issued again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WagerError::Conflict { .. } | WagerError::ExternalLookupFailed { .. } | WagerError::Storage(_)
        )
    }
}

impl From<crate::storage::StoreError> for WagerError {
    fn from(e: crate::storage::StoreError) -> Self {
        match e {
            crate::storage::StoreError::VersionConflict { entity, .. } => {
                WagerError::Conflict { entity, attempts: 1 }
            }
            other => WagerError::Storage(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
