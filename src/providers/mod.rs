//! External collaborators.
//!
//! Defines the read-only `LeaderboardSnapshot` and `AccountDirectory`
//! traits the engine consumes, with implementations for:
//! - an HTTP leaderboard service (`http`)
//! - in-memory fixtures used by the daemon's static mode and tests (`memory`)

pub mod http;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::AccountId;

/// One row of a third-party leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    /// External identity of the player (matches `Account::player_key`).
    pub participant_key: String,
    /// 1 is best.
    pub rank: u32,
    pub score: f64,
}

/// Read-only rank/score lookup.
///
/// A participant with no entry is treated as having not competed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaderboardSnapshot: Send + Sync {
    async fn get_entries(&self, leaderboard_ref: &str) -> Result<Vec<LeaderboardEntry>>;
}

/// Maps an external identity to an internal account.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// `Ok(None)` when the identity is unknown.
    async fn resolve(&self, user_key: &str) -> Result<Option<AccountId>>;
}
