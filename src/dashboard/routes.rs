//! Dashboard API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<DashboardState>`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::engine::grant::GrantReport;
use crate::engine::sweep::SweepReport;
use crate::engine::WagerEngine;
use crate::types::{Account, AccountId, Competition, CompetitionId, Gp, LedgerEntry, WagerError};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub engine: Arc<WagerEngine>,
    pub started_at: DateTime<Utc>,
    pub last_grant: RwLock<Option<GrantReport>>,
    pub last_sweep: RwLock<Option<SweepReport>>,
}

impl DashboardState {
    pub fn new(engine: Arc<WagerEngine>) -> Self {
        Self {
            engine,
            started_at: Utc::now(),
            last_grant: RwLock::new(None),
            last_sweep: RwLock::new(None),
        }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: i64,
    pub accounts: usize,
    pub gp_in_circulation: Gp,
    pub active_competitions: usize,
    pub open_competitions: usize,
    pub last_grant: Option<GrantReport>,
    pub last_sweep: Option<SweepReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardRow {
    pub rank: usize,
    pub account: AccountId,
    pub balance: Gp,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountResponse {
    pub account: Account,
    pub consistent: bool,
    pub recent_entries: Vec<LedgerEntry>,
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    pub top: Option<usize>,
}

/// Error body for failed lookups.
pub struct ApiError(StatusCode, String);

impl From<WagerError> for ApiError {
    fn from(err: WagerError) -> Self {
        let status = match err {
            WagerError::NotFound { .. } => StatusCode::NOT_FOUND,
            WagerError::Conflict { .. } | WagerError::ExternalLookupFailed { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

const DEFAULT_LEADERBOARD_SIZE: usize = 10;
const MAX_LEADERBOARD_SIZE: usize = 100;
const RECENT_ENTRIES: usize = 50;

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let accounts = state.engine.ledger().accounts().await?;
    let active = state.engine.list_active().await?;
    let open = state.engine.list_open().await?;

    Ok(Json(StatusResponse {
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        accounts: accounts.len(),
        gp_in_circulation: accounts.iter().map(|a| a.balance).sum(),
        active_competitions: active.len(),
        open_competitions: open.len(),
        last_grant: state.last_grant.read().await.clone(),
        last_sweep: state.last_sweep.read().await.clone(),
    }))
}

/// GET /api/leaderboard?top=N
pub async fn get_leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<Vec<LeaderboardRow>>, ApiError> {
    let top = query
        .top
        .unwrap_or(DEFAULT_LEADERBOARD_SIZE)
        .min(MAX_LEADERBOARD_SIZE);
    let rows = state
        .engine
        .get_leaderboard(top)
        .await?
        .into_iter()
        .enumerate()
        .map(|(i, (account, balance))| LeaderboardRow {
            rank: i + 1,
            account,
            balance,
        })
        .collect();
    Ok(Json(rows))
}

/// GET /api/competitions/active
pub async fn get_active(State(state): State<AppState>) -> Result<Json<Vec<Competition>>, ApiError> {
    Ok(Json(state.engine.list_active().await?))
}

/// GET /api/competitions/open
pub async fn get_open(State(state): State<AppState>) -> Result<Json<Vec<Competition>>, ApiError> {
    Ok(Json(state.engine.list_open().await?))
}

/// GET /api/competitions/:id
pub async fn get_competition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Competition>, ApiError> {
    let id: CompetitionId = id
        .parse()
        .map_err(|_| ApiError(StatusCode::BAD_REQUEST, format!("invalid competition id: {id}")))?;
    Ok(Json(state.engine.get_competition(&id).await?))
}

/// GET /api/accounts/:id
pub async fn get_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AccountResponse>, ApiError> {
    let id = AccountId::new(id);
    let account = state.engine.get_account(&id).await?;
    let consistent = state.engine.verify_account(&id).await?;
    let mut entries = state.engine.history(&id).await?;
    let start = entries.len().saturating_sub(RECENT_ENTRIES);
    let recent_entries = entries.split_off(start);

    Ok(Json(AccountResponse {
        account,
        consistent,
        recent_entries,
    }))
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
