//! Ledger: the only writer of account balances.
//!
//! Every balance change is a compare-and-set of the account document
//! together with one appended `LedgerEntry`. Conflicting writers re-read
//! and retry; two debits racing for the same balance can never both land
//! if together they would overdraw the account.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::storage::{LedgerCommit, Store, StoreError};
use crate::types::{Account, AccountId, EntryReason, Gp, GrantPeriod, LedgerEntry, WagerError};

/// Convert an unsigned amount into a signed entry amount.
fn signed(amount: Gp) -> Result<i64, WagerError> {
    i64::try_from(amount).map_err(|_| WagerError::InvalidAmount)
}

/// Default number of compare-and-set attempts before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 16;

/// A pending balance change computed from the account as last read.
struct Mutation {
    account: Account,
    entry: LedgerEntry,
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
    max_retries: u32,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    // -- Accounts --------------------------------------------------------

    /// Create an account with a zero balance. Opening an existing account
    /// returns it unchanged.
    pub async fn open_account(&self, id: &AccountId, player_key: &str) -> Result<Account, WagerError> {
        match self.store.insert_account(Account::new(id.clone(), player_key)).await {
            Ok(stored) => {
                info!(account = %id, player_key, "Account opened");
                Ok(stored.value)
            }
            Err(StoreError::Duplicate { .. }) => self.account(id).await,
            Err(e) => Err(e.into()),
        }
    }

    pub async fn account(&self, id: &AccountId) -> Result<Account, WagerError> {
        self.store
            .account(id)
            .await?
            .map(|a| a.value)
            .ok_or_else(|| WagerError::account_not_found(id))
    }

    pub async fn accounts(&self) -> Result<Vec<Account>, WagerError> {
        let mut accounts: Vec<Account> = self
            .store
            .accounts()
            .await?
            .into_iter()
            .map(|a| a.value)
            .collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    pub async fn balance(&self, id: &AccountId) -> Result<Gp, WagerError> {
        Ok(self.account(id).await?.balance)
    }

    /// Accounts ordered by balance (highest first), ties by id.
    pub async fn leaderboard(&self, top_n: usize) -> Result<Vec<(AccountId, Gp)>, WagerError> {
        let mut rows: Vec<(AccountId, Gp)> = self
            .accounts()
            .await?
            .into_iter()
            .map(|a| (a.id, a.balance))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rows.truncate(top_n);
        Ok(rows)
    }

    pub async fn history(&self, id: &AccountId) -> Result<Vec<LedgerEntry>, WagerError> {
        Ok(self.store.entries_for_account(id).await?)
    }

    pub async fn entries_for_reference(&self, reference: &str) -> Result<Vec<LedgerEntry>, WagerError> {
        Ok(self.store.entries_for_reference(reference).await?)
    }

    /// Check that the cached balance equals the signed sum of entries.
    pub async fn verify_account(&self, id: &AccountId) -> Result<bool, WagerError> {
        let account = self.account(id).await?;
        let sum: i128 = self
            .history(id)
            .await?
            .iter()
            .map(|e| e.amount as i128)
            .sum();
        let consistent = sum == account.balance as i128;
        if !consistent {
            warn!(account = %id, balance = account.balance, entries_sum = %sum, "Balance drift detected");
        }
        Ok(consistent)
    }

    // -- Movements -------------------------------------------------------

    pub async fn credit(
        &self,
        account: &AccountId,
        amount: Gp,
        reason: EntryReason,
        reference: &str,
    ) -> Result<LedgerEntry, WagerError> {
        self.post(account, signed(amount)?, reason, reference, None).await
    }

    /// Credit at most once per `(account, key)`. A repeated key returns
    /// the entry written the first time.
    pub async fn credit_once(
        &self,
        account: &AccountId,
        amount: Gp,
        reason: EntryReason,
        reference: &str,
        key: String,
    ) -> Result<LedgerEntry, WagerError> {
        self.post(account, signed(amount)?, reason, reference, Some(key)).await
    }

    /// Debit `amount`, failing with `InsufficientFunds` (and no effect) if
    /// the balance does not cover it.
    pub async fn debit(
        &self,
        account: &AccountId,
        amount: Gp,
        reason: EntryReason,
        reference: &str,
    ) -> Result<LedgerEntry, WagerError> {
        self.post(account, -signed(amount)?, reason, reference, None).await
    }

    async fn post(
        &self,
        account: &AccountId,
        amount: i64,
        reason: EntryReason,
        reference: &str,
        key: Option<String>,
    ) -> Result<LedgerEntry, WagerError> {
        if amount == 0 {
            return Err(WagerError::InvalidAmount);
        }

        let committed = self
            .apply(account, |current| {
                let balance = if amount >= 0 {
                    current.balance.checked_add(amount.unsigned_abs())
                } else {
                    current.balance.checked_sub(amount.unsigned_abs())
                };
                let Some(balance) = balance else {
                    return Err(WagerError::InsufficientFunds {
                        account: current.id.clone(),
                        needed: amount.unsigned_abs(),
                        available: current.balance,
                    });
                };

                let mut next = current.clone();
                next.balance = balance;
                Ok(Some(Mutation {
                    account: next,
                    entry: LedgerEntry {
                        seq: 0,
                        account: current.id.clone(),
                        amount,
                        reason,
                        reference: reference.to_string(),
                        idempotency_key: key.clone(),
                        timestamp: Utc::now(),
                    },
                }))
            })
            .await?;

        // `post` always produces a mutation, so the commit is always present.
        committed.ok_or_else(|| WagerError::Storage("ledger post produced no entry".to_string()))
    }

    /// Credit `stipend` and set the account's grant marker to `period` in a
    /// single conditional write. Returns `None` when the account was already
    /// granted for `period`, unless `force` is set.
    pub async fn grant(
        &self,
        account: &AccountId,
        period: &GrantPeriod,
        stipend: Gp,
        force: bool,
    ) -> Result<Option<LedgerEntry>, WagerError> {
        if stipend == 0 {
            return Err(WagerError::InvalidAmount);
        }
        let amount = signed(stipend)?;

        self.apply(account, |current| {
            if !force && current.last_grant_period.as_ref() == Some(period) {
                return Ok(None);
            }
            let Some(balance) = current.balance.checked_add(stipend) else {
                return Err(WagerError::InvalidAmount);
            };

            let mut next = current.clone();
            next.balance = balance;
            next.last_grant_period = Some(period.clone());
            Ok(Some(Mutation {
                account: next,
                entry: LedgerEntry {
                    seq: 0,
                    account: current.id.clone(),
                    amount,
                    reason: EntryReason::Stipend,
                    reference: format!("grant:{period}"),
                    idempotency_key: None,
                    timestamp: Utc::now(),
                },
            }))
        })
        .await
    }

    /// Read-modify-write loop shared by every movement.
    async fn apply<F>(&self, id: &AccountId, mutate: F) -> Result<Option<LedgerEntry>, WagerError>
    where
        F: Fn(&Account) -> Result<Option<Mutation>, WagerError>,
    {
        for attempt in 1..=self.max_retries {
            let current = self
                .store
                .account(id)
                .await?
                .ok_or_else(|| WagerError::account_not_found(id))?;

            let Some(mutation) = mutate(&current.value)? else {
                return Ok(None);
            };

            match self
                .store
                .commit_ledger(current.version, mutation.account, mutation.entry)
                .await
            {
                Ok(LedgerCommit::Applied(entry)) => {
                    debug!(
                        account = %id,
                        amount = entry.amount,
                        reason = %entry.reason,
                        reference = %entry.reference,
                        seq = entry.seq,
                        "Ledger entry appended"
                    );
                    return Ok(Some(entry));
                }
                Ok(LedgerCommit::Replayed(entry)) => {
                    debug!(account = %id, seq = entry.seq, "Idempotent ledger entry replayed");
                    return Ok(Some(entry));
                }
                Err(StoreError::VersionConflict { expected, actual, .. }) => {
                    debug!(account = %id, attempt, expected, actual, "Ledger write conflict, retrying");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(account = %id, attempts = self.max_retries, "Ledger retries exhausted");
        Err(WagerError::Conflict {
            entity: format!("account:{id}"),
            attempts: self.max_retries,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
