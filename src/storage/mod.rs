//! Persistence layer.
//!
//! The engine talks to persistence through the `Store` trait: versioned
//! reads, compare-and-set writes, and an append-only ledger log. The
//! in-memory implementation backs the daemon and the test suite and can be
//! saved to / restored from a JSON snapshot file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::types::{Account, AccountId, Competition, CompetitionId, LedgerEntry};

/// Default snapshot file path.
const DEFAULT_SNAPSHOT_FILE: &str = "wagerbook_state.json";

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// A stored document with the version it was read at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Version conflict on {entity}: expected v{expected}, found v{actual}")]
    VersionConflict {
        entity: String,
        expected: u64,
        actual: u64,
    },

    #[error("{entity} already exists")]
    Duplicate { entity: String },

    #[error("{entity} does not exist")]
    Missing { entity: String },

    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot format error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Outcome of a ledger commit.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerCommit {
    /// The entry was appended and the account written.
    Applied(LedgerEntry),
    /// An entry with the same idempotency key already existed; nothing changed.
    Replayed(LedgerEntry),
}

impl LedgerCommit {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            LedgerCommit::Applied(e) | LedgerCommit::Replayed(e) => e,
        }
    }

    pub fn into_entry(self) -> LedgerEntry {
        match self {
            LedgerCommit::Applied(e) | LedgerCommit::Replayed(e) => e,
        }
    }
}

/// Abstraction over the persistence technology.
///
/// Every write is a compare-and-set against the version the caller read.
/// A stale write fails with `StoreError::VersionConflict` and the caller
/// must re-read and retry.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create an account at version 1.
    async fn insert_account(&self, account: Account) -> Result<Versioned<Account>, StoreError>;

    async fn account(&self, id: &AccountId) -> Result<Option<Versioned<Account>>, StoreError>;

    async fn accounts(&self) -> Result<Vec<Versioned<Account>>, StoreError>;

    /// Atomically write `account` and append `entry`, provided the stored
    /// account is still at `expected_version`. If `entry` carries an
    /// idempotency key already recorded for this account, the earlier
    /// entry is returned and nothing is written.
    async fn commit_ledger(
        &self,
        expected_version: u64,
        account: Account,
        entry: LedgerEntry,
    ) -> Result<LedgerCommit, StoreError>;

    async fn entries_for_account(&self, id: &AccountId) -> Result<Vec<LedgerEntry>, StoreError>;

    async fn entries_for_reference(&self, reference: &str) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Create a competition at version 1.
    async fn insert_competition(
        &self,
        competition: Competition,
    ) -> Result<Versioned<Competition>, StoreError>;

    async fn competition(
        &self,
        id: &CompetitionId,
    ) -> Result<Option<Versioned<Competition>>, StoreError>;

    async fn competitions(&self) -> Result<Vec<Versioned<Competition>>, StoreError>;

    /// Write `competition` if the stored copy is still at `expected_version`.
    async fn commit_competition(
        &self,
        expected_version: u64,
        competition: Competition,
    ) -> Result<Versioned<Competition>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LedgerTables {
    accounts: HashMap<AccountId, Versioned<Account>>,
    entries: Vec<LedgerEntry>,
    /// (account, idempotency key) -> index into `entries`.
    keys: HashMap<(AccountId, String), usize>,
}

/// Serializable image of a `MemoryStore`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub accounts: Vec<Versioned<Account>>,
    pub entries: Vec<LedgerEntry>,
    pub competitions: Vec<Versioned<Competition>>,
}

/// `Store` held entirely in memory.
///
/// The table locks are only held for the duration of a single read or
/// compare-and-set, never across an engine operation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    ledger: RwLock<LedgerTables>,
    competitions: RwLock<HashMap<CompetitionId, Versioned<Competition>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a snapshot, re-indexing idempotency keys.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut tables = LedgerTables::default();
        for (idx, entry) in snapshot.entries.iter().enumerate() {
            if let Some(key) = &entry.idempotency_key {
                tables.keys.insert((entry.account.clone(), key.clone()), idx);
            }
        }
        tables.entries = snapshot.entries;
        tables.accounts = snapshot
            .accounts
            .into_iter()
            .map(|a| (a.value.id.clone(), a))
            .collect();

        let competitions = snapshot
            .competitions
            .into_iter()
            .map(|c| (c.value.id, c))
            .collect();

        Self {
            ledger: RwLock::new(tables),
            competitions: RwLock::new(competitions),
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        let ledger = self.ledger.read().await;
        let competitions = self.competitions.read().await;

        let mut accounts: Vec<_> = ledger.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.value.id.cmp(&b.value.id));
        let mut competitions: Vec<_> = competitions.values().cloned().collect();
        competitions.sort_by_key(|c| c.value.created_at);

        Snapshot {
            accounts,
            entries: ledger.entries.clone(),
            competitions,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_account(&self, account: Account) -> Result<Versioned<Account>, StoreError> {
        let mut ledger = self.ledger.write().await;
        if ledger.accounts.contains_key(&account.id) {
            return Err(StoreError::Duplicate {
                entity: format!("account:{}", account.id),
            });
        }
        let stored = Versioned {
            version: 1,
            value: account,
        };
        ledger.accounts.insert(stored.value.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn account(&self, id: &AccountId) -> Result<Option<Versioned<Account>>, StoreError> {
        Ok(self.ledger.read().await.accounts.get(id).cloned())
    }

    async fn accounts(&self) -> Result<Vec<Versioned<Account>>, StoreError> {
        Ok(self.ledger.read().await.accounts.values().cloned().collect())
    }

    async fn commit_ledger(
        &self,
        expected_version: u64,
        account: Account,
        mut entry: LedgerEntry,
    ) -> Result<LedgerCommit, StoreError> {
        let mut ledger = self.ledger.write().await;

        if let Some(key) = &entry.idempotency_key {
            if let Some(&idx) = ledger.keys.get(&(entry.account.clone(), key.clone())) {
                return Ok(LedgerCommit::Replayed(ledger.entries[idx].clone()));
            }
        }

        let entity = format!("account:{}", account.id);
        let current = ledger
            .accounts
            .get(&account.id)
            .map(|a| a.version)
            .ok_or_else(|| StoreError::Missing {
                entity: entity.clone(),
            })?;
        if current != expected_version {
            return Err(StoreError::VersionConflict {
                entity,
                expected: expected_version,
                actual: current,
            });
        }

        entry.seq = ledger.entries.len() as u64 + 1;
        let idx = ledger.entries.len();
        if let Some(key) = &entry.idempotency_key {
            ledger.keys.insert((entry.account.clone(), key.clone()), idx);
        }
        ledger.entries.push(entry.clone());
        ledger.accounts.insert(
            account.id.clone(),
            Versioned {
                version: current + 1,
                value: account,
            },
        );

        Ok(LedgerCommit::Applied(entry))
    }

    async fn entries_for_account(&self, id: &AccountId) -> Result<Vec<LedgerEntry>, StoreError> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .entries
            .iter()
            .filter(|e| &e.account == id)
            .cloned()
            .collect())
    }

    async fn entries_for_reference(&self, reference: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .entries
            .iter()
            .filter(|e| e.reference == reference)
            .cloned()
            .collect())
    }

    async fn insert_competition(
        &self,
        competition: Competition,
    ) -> Result<Versioned<Competition>, StoreError> {
        let mut competitions = self.competitions.write().await;
        if competitions.contains_key(&competition.id) {
            return Err(StoreError::Duplicate {
                entity: format!("competition:{}", competition.id),
            });
        }
        let stored = Versioned {
            version: 1,
            value: competition,
        };
        competitions.insert(stored.value.id, stored.clone());
        Ok(stored)
    }

    async fn competition(
        &self,
        id: &CompetitionId,
    ) -> Result<Option<Versioned<Competition>>, StoreError> {
        Ok(self.competitions.read().await.get(id).cloned())
    }

    async fn competitions(&self) -> Result<Vec<Versioned<Competition>>, StoreError> {
        Ok(self.competitions.read().await.values().cloned().collect())
    }

    async fn commit_competition(
        &self,
        expected_version: u64,
        competition: Competition,
    ) -> Result<Versioned<Competition>, StoreError> {
        let mut competitions = self.competitions.write().await;
        let entity = format!("competition:{}", competition.id);
        let current = competitions
            .get(&competition.id)
            .map(|c| c.version)
            .ok_or_else(|| StoreError::Missing {
                entity: entity.clone(),
            })?;
        if current != expected_version {
            return Err(StoreError::VersionConflict {
                entity,
                expected: expected_version,
                actual: current,
            });
        }
        let stored = Versioned {
            version: current + 1,
            value: competition,
        };
        competitions.insert(stored.value.id, stored.clone());
        Ok(stored)
    }
}

// ---------------------------------------------------------------------------
// Snapshot files
// ---------------------------------------------------------------------------

/// Save the store to a JSON file.
pub async fn save_snapshot(store: &MemoryStore, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_SNAPSHOT_FILE);
    let snapshot = store.snapshot().await;
    let json = serde_json::to_string_pretty(&snapshot)
        .context("Failed to serialise store snapshot")?;

    tokio::fs::write(path, &json)
        .await
        .with_context(|| format!("Failed to write snapshot to {path}"))?;

    debug!(
        path,
        accounts = snapshot.accounts.len(),
        entries = snapshot.entries.len(),
        "Snapshot saved"
    );
    Ok(())
}

/// Load a store from a JSON file.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_snapshot(path: Option<&str>) -> Result<Option<MemoryStore>> {
    let path = path.unwrap_or(DEFAULT_SNAPSHOT_FILE);

    if !Path::new(path).exists() {
        info!(path, "No snapshot found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot from {path}"))?;
    let snapshot: Snapshot = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse snapshot from {path}"))?;

    info!(
        path,
        accounts = snapshot.accounts.len(),
        entries = snapshot.entries.len(),
        competitions = snapshot.competitions.len(),
        "Snapshot loaded from disk"
    );

    Ok(Some(MemoryStore::from_snapshot(snapshot)))
}

/// Delete the snapshot file (for testing or reset).
pub fn delete_snapshot(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_SNAPSHOT_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to delete snapshot file {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
