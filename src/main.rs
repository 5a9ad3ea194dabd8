//! WAGERBOOK: GP wager, pot-betting and stipend engine.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the store from its snapshot (or creates a fresh one), and runs
//! the periodic grant and expiry sweep with graceful shutdown.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use wagerbook::config::{self, LeaderboardProvider};
use wagerbook::dashboard::{self, routes::DashboardState};
use wagerbook::engine::WagerEngine;
use wagerbook::providers::http::HttpLeaderboard;
use wagerbook::providers::memory::{StaticDirectory, StaticLeaderboard};
use wagerbook::providers::LeaderboardSnapshot;
use wagerbook::storage::{self, MemoryStore, Store};

const BANNER: &str = r#"
__        ___    ____ _____ ____  ____   ___   ___  _  __
\ \      / / \  / ___| ____|  _ \| __ ) / _ \ / _ \| |/ /
 \ \ /\ / / _ \| |  _|  _| | |_) |  _ \| | | | | | | ' /
  \ V  V / ___ \ |_| | |___|  _ <| |_) | |_| | |_| | . \
   \_/\_/_/   \_\____|_____|_| \_\____/ \___/ \___/|_|\_\

  GP wagers, side pots and stipends
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;

    init_logging();

    println!("{BANNER}");
    info!(
        stipend = cfg.grant.stipend,
        cadence = ?cfg.grant.cadence,
        competition_duration_secs = cfg.engine.competition_duration_secs,
        house_guarantee_rate = %cfg.engine.house_guarantee_rate,
        "WAGERBOOK starting up"
    );

    // -- Restore or create the store -------------------------------------

    let snapshot_path = cfg.storage.snapshot_path.as_deref();
    let store = match storage::load_snapshot(snapshot_path)? {
        Some(store) => Arc::new(store),
        None => {
            info!("Fresh start");
            Arc::new(MemoryStore::new())
        }
    };

    // -- Collaborators ---------------------------------------------------

    let leaderboard: Arc<dyn LeaderboardSnapshot> = match cfg.leaderboard.provider {
        LeaderboardProvider::Http => {
            let base_url = cfg
                .leaderboard
                .base_url
                .as_deref()
                .context("leaderboard.base_url is required for the http provider")?;
            let api_key = cfg
                .leaderboard
                .api_key_env
                .as_deref()
                .and_then(|env| config::AppConfig::resolve_env(env).ok());
            if api_key.is_none() {
                warn!("No leaderboard API key configured, sending unauthenticated requests");
            }
            info!(base_url, "Using HTTP leaderboard provider");
            Arc::new(HttpLeaderboard::new(base_url, api_key)?)
        }
        LeaderboardProvider::Static => {
            warn!("Using static leaderboard, competitions resolve as no contest");
            Arc::new(StaticLeaderboard::new())
        }
    };
    let directory = Arc::new(StaticDirectory::identity());

    let engine = Arc::new(WagerEngine::new(
        store.clone() as Arc<dyn Store>,
        leaderboard,
        directory,
        cfg.engine_config(),
    ));
    let dashboard_state = Arc::new(DashboardState::new(engine.clone()));

    if cfg.dashboard.enabled {
        dashboard::spawn_dashboard(dashboard_state.clone(), cfg.dashboard.port).await?;
    }

    // -- Main loop -------------------------------------------------------

    let mut grant_tick = tokio::time::interval(Duration::from_secs(cfg.grant.interval_secs));
    let mut sweep_tick = tokio::time::interval(Duration::from_secs(cfg.sweep.interval_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        grant_interval_secs = cfg.grant.interval_secs,
        sweep_interval_secs = cfg.sweep.interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = grant_tick.tick() => {
                match engine.run_grant_for(Utc::now()).await {
                    Ok(report) => *dashboard_state.last_grant.write().await = Some(report),
                    Err(e) => error!(error = %e, "Periodic grant failed, retrying next tick"),
                }
                persist(&store, snapshot_path).await;
            }
            _ = sweep_tick.tick() => {
                match engine.sweep(Utc::now()).await {
                    Ok(report) => *dashboard_state.last_sweep.write().await = Some(report),
                    Err(e) => error!(error = %e, "Expiry sweep failed, retrying next tick"),
                }
                persist(&store, snapshot_path).await;
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    storage::save_snapshot(&store, snapshot_path).await?;
    let accounts = engine.ledger().accounts().await?;
    info!(
        accounts = accounts.len(),
        gp_in_circulation = accounts.iter().map(|a| a.balance).sum::<u64>(),
        active = engine.list_active().await?.len(),
        "WAGERBOOK shut down cleanly."
    );

    Ok(())
}

async fn persist(store: &MemoryStore, path: Option<&str>) {
    if let Err(e) = storage::save_snapshot(store, path).await {
        error!(error = %e, "Failed to save snapshot");
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("wagerbook=info"));

    let json_logging = std::env::var("WAGERBOOK_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
