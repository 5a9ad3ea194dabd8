//! Shared fixtures: an engine wired to controllable collaborators.

use std::sync::Arc;

use wagerbook::engine::{EngineConfig, WagerEngine};
use wagerbook::providers::memory::{StaticDirectory, StaticLeaderboard};
use wagerbook::storage::MemoryStore;
use wagerbook::types::{AccountId, Competition, EntryReason, Gp};

pub struct TestEngine {
    pub engine: Arc<WagerEngine>,
    pub store: Arc<MemoryStore>,
    pub leaderboard: StaticLeaderboard,
    pub directory: StaticDirectory,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let leaderboard = StaticLeaderboard::new();
        let directory = StaticDirectory::identity();
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(WagerEngine::new(
            store.clone(),
            Arc::new(leaderboard.clone()),
            Arc::new(directory.clone()),
            config,
        ));
        Self {
            engine,
            store,
            leaderboard,
            directory,
        }
    }

    /// Open `name` and seed it with `balance` GP.
    pub async fn funded(&self, name: &str, balance: Gp) -> AccountId {
        let id = self.engine.open_account(name).await.unwrap().id;
        if balance > 0 {
            self.engine
                .ledger()
                .credit(&id, balance, EntryReason::Stipend, "seed")
                .await
                .unwrap();
        }
        id
    }

    pub async fn balance(&self, id: &AccountId) -> Gp {
        self.engine.get_balance(id).await.unwrap()
    }

    /// Net ledger movement (credits minus debits) tagged with a competition.
    pub async fn net_movement(&self, competition: &Competition) -> i64 {
        self.engine
            .ledger()
            .entries_for_reference(&competition.reference())
            .await
            .unwrap()
            .iter()
            .map(|e| e.amount)
            .sum()
    }
}
