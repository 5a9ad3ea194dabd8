//! In-memory collaborators.
//!
//! Deterministic leaderboard and directory fixtures. All state is
//! controllable from the caller, including forced failures.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::{AccountDirectory, LeaderboardEntry, LeaderboardSnapshot};
use crate::types::AccountId;

// ---------------------------------------------------------------------------
// Leaderboard
// ---------------------------------------------------------------------------

/// Leaderboard whose entries are set directly.
#[derive(Clone, Default)]
pub struct StaticLeaderboard {
    boards: Arc<Mutex<HashMap<String, Vec<LeaderboardEntry>>>>,
    /// If set, every lookup fails with this message.
    force_error: Arc<Mutex<Option<String>>>,
}

impl StaticLeaderboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entries of one leaderboard.
    pub fn set_entries(&self, leaderboard_ref: &str, entries: Vec<LeaderboardEntry>) {
        self.boards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(leaderboard_ref.to_string(), entries);
    }

    /// Convenience: set `(player_key, rank, score)` rows.
    pub fn set_ranks(&self, leaderboard_ref: &str, rows: &[(&str, u32, f64)]) {
        let entries = rows
            .iter()
            .map(|(key, rank, score)| LeaderboardEntry {
                participant_key: key.to_string(),
                rank: *rank,
                score: *score,
            })
            .collect();
        self.set_entries(leaderboard_ref, entries);
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[async_trait]
impl LeaderboardSnapshot for StaticLeaderboard {
    async fn get_entries(&self, leaderboard_ref: &str) -> Result<Vec<LeaderboardEntry>> {
        if let Some(msg) = self.force_error.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(anyhow!(msg));
        }
        Ok(self
            .boards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(leaderboard_ref)
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// Directory backed by a map. In identity mode every key not explicitly
/// registered maps to an account of the same name.
#[derive(Clone, Default)]
pub struct StaticDirectory {
    identity: bool,
    mappings: Arc<Mutex<HashMap<String, AccountId>>>,
    removed: Arc<Mutex<HashSet<String>>>,
    force_error: Arc<Mutex<Option<String>>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity() -> Self {
        Self {
            identity: true,
            ..Self::default()
        }
    }

    pub fn register(&self, user_key: &str, account: AccountId) {
        self.removed.lock().unwrap_or_else(|e| e.into_inner()).remove(user_key);
        self.mappings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_key.to_string(), account);
    }

    /// Make `user_key` unresolvable.
    pub fn remove(&self, user_key: &str) {
        self.mappings.lock().unwrap_or_else(|e| e.into_inner()).remove(user_key);
        self.removed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_key.to_string());
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[async_trait]
impl AccountDirectory for StaticDirectory {
    async fn resolve(&self, user_key: &str) -> Result<Option<AccountId>> {
        if let Some(msg) = self.force_error.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(anyhow!(msg));
        }
        if self.removed.lock().unwrap_or_else(|e| e.into_inner()).contains(user_key) {
            return Ok(None);
        }
        if let Some(id) = self.mappings.lock().unwrap_or_else(|e| e.into_inner()).get(user_key) {
            return Ok(Some(id.clone()));
        }
        Ok(self.identity.then(|| AccountId::new(user_key)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
