//! Core engine: ledger, betting pool, competition lifecycle and the
//! periodic jobs, behind a single `WagerEngine` facade.

pub mod grant;
pub mod ledger;
pub mod lifecycle;
pub mod pool;
pub mod resolver;
pub mod sweep;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::providers::{AccountDirectory, LeaderboardSnapshot};
use crate::storage::Store;
use crate::types::{
    Account, AccountId, Bet, Competition, CompetitionId, CompetitionMeta, CompetitionState, Gp,
    GrantPeriod, LedgerEntry, Response, WagerError,
};

use grant::{GrantCadence, GrantReport, PeriodicGrant};
use ledger::{Ledger, DEFAULT_MAX_RETRIES};
use lifecycle::{CompetitionLifecycle, LifecycleConfig};
use pool::{BettingPool, PoolConfig};
use sweep::SweepReport;

/// Tunables for the whole engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub lifecycle: LifecycleConfig,
    pub pool: PoolConfig,
    pub stipend: Gp,
    pub cadence: GrantCadence,
    pub max_cas_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleConfig::default(),
            pool: PoolConfig::default(),
            stipend: 1_000,
            cadence: GrantCadence::Monthly,
            max_cas_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// The operations offered to the presentation layer. Every mutating call
/// returns the updated entity or a typed `WagerError`.
pub struct WagerEngine {
    ledger: Ledger,
    lifecycle: CompetitionLifecycle,
    grant: PeriodicGrant,
    directory: Arc<dyn AccountDirectory>,
    cadence: GrantCadence,
}

impl WagerEngine {
    pub fn new(
        store: Arc<dyn Store>,
        leaderboard: Arc<dyn LeaderboardSnapshot>,
        directory: Arc<dyn AccountDirectory>,
        config: EngineConfig,
    ) -> Self {
        let ledger = Ledger::new(store.clone()).with_max_retries(config.max_cas_retries);
        let pool = BettingPool::new(ledger.clone(), config.pool);
        let lifecycle = CompetitionLifecycle::new(
            store,
            ledger.clone(),
            pool,
            leaderboard,
            directory.clone(),
            config.lifecycle,
        );
        let grant = PeriodicGrant::new(ledger.clone(), config.stipend);
        Self {
            ledger,
            lifecycle,
            grant,
            directory,
            cadence: config.cadence,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn cadence(&self) -> GrantCadence {
        self.cadence
    }

    // -- Accounts --------------------------------------------------------

    /// Resolve an external identity and open its account. Opening an
    /// existing account returns it unchanged.
    pub async fn open_account(&self, user_key: &str) -> Result<Account, WagerError> {
        let id = self
            .directory
            .resolve(user_key)
            .await
            .map_err(|e| WagerError::ExternalLookupFailed {
                collaborator: "account directory",
                message: format!("{e:#}"),
            })?
            .ok_or_else(|| WagerError::NotFound {
                kind: "user",
                id: user_key.to_string(),
            })?;
        let account = self.ledger.open_account(&id, user_key).await?;
        info!(account = %account.id, player_key = %account.player_key, "Account ready");
        Ok(account)
    }

    // -- Competitions ----------------------------------------------------

    pub async fn create_competition(
        &self,
        creator: &AccountId,
        opponent: Option<&AccountId>,
        wager: Gp,
        leaderboard_ref: &str,
        meta: CompetitionMeta,
    ) -> Result<Competition, WagerError> {
        self.lifecycle
            .create(creator, opponent, wager, leaderboard_ref, meta)
            .await
    }

    pub async fn respond(
        &self,
        id: &CompetitionId,
        account: &AccountId,
        response: Response,
    ) -> Result<Competition, WagerError> {
        self.lifecycle.respond(id, account, response).await
    }

    pub async fn join(&self, id: &CompetitionId, account: &AccountId) -> Result<Competition, WagerError> {
        self.lifecycle.join(id, account).await
    }

    pub async fn start(&self, id: &CompetitionId) -> Result<Competition, WagerError> {
        self.lifecycle.start(id).await
    }

    pub async fn place_bet(
        &self,
        id: &CompetitionId,
        bettor: &AccountId,
        target: &AccountId,
        amount: Gp,
    ) -> Result<Bet, WagerError> {
        self.lifecycle.place_bet(id, bettor, target, amount).await
    }

    pub async fn resolve(&self, id: &CompetitionId) -> Result<Competition, WagerError> {
        self.lifecycle.resolve(id).await
    }

    // -- Periodic work ---------------------------------------------------

    pub async fn run_periodic_grant(&self, period: &GrantPeriod) -> Result<GrantReport, WagerError> {
        self.grant.run(period).await
    }

    /// Grant for the period containing `now` under the configured cadence.
    pub async fn run_grant_for(&self, now: DateTime<Utc>) -> Result<GrantReport, WagerError> {
        self.grant.run(&self.cadence.period_for(now)).await
    }

    pub async fn force_grant(&self, account: &AccountId, period: &GrantPeriod) -> Result<LedgerEntry, WagerError> {
        self.grant.force_grant(account, period).await
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, WagerError> {
        sweep::sweep(&self.lifecycle, now).await
    }

    // -- Reads -----------------------------------------------------------

    pub async fn get_competition(&self, id: &CompetitionId) -> Result<Competition, WagerError> {
        self.lifecycle.get(id).await
    }

    pub async fn list_active(&self) -> Result<Vec<Competition>, WagerError> {
        self.lifecycle.list(CompetitionState::Active).await
    }

    pub async fn list_open(&self) -> Result<Vec<Competition>, WagerError> {
        self.lifecycle.list(CompetitionState::Open).await
    }

    pub async fn get_account(&self, id: &AccountId) -> Result<Account, WagerError> {
        self.ledger.account(id).await
    }

    pub async fn get_balance(&self, id: &AccountId) -> Result<Gp, WagerError> {
        self.ledger.balance(id).await
    }

    pub async fn get_leaderboard(&self, top_n: usize) -> Result<Vec<(AccountId, Gp)>, WagerError> {
        self.ledger.leaderboard(top_n).await
    }

    pub async fn history(&self, id: &AccountId) -> Result<Vec<LedgerEntry>, WagerError> {
        self.ledger.history(id).await
    }

    pub async fn verify_account(&self, id: &AccountId) -> Result<bool, WagerError> {
        self.ledger.verify_account(id).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
