//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API keys) are referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;

use crate::engine::grant::GrantCadence;
use crate::engine::ledger::DEFAULT_MAX_RETRIES;
use crate::engine::lifecycle::LifecycleConfig;
use crate::engine::pool::PoolConfig;
use crate::engine::EngineConfig;
use crate::types::MAX_GP;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub grant: GrantSection,
    pub sweep: SweepSection,
    pub leaderboard: LeaderboardSection,
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub storage: StorageSection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineSection {
    pub competition_duration_secs: i64,
    #[serde(default = "default_max_participants")]
    pub default_max_participants: u32,
    #[serde(default = "default_house_rate")]
    pub house_guarantee_rate: Decimal,
    #[serde(default = "default_max_retries")]
    pub max_cas_retries: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GrantSection {
    pub stipend: u64,
    #[serde(default)]
    pub cadence: GrantCadence,
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SweepSection {
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LeaderboardProvider {
    Http,
    Static,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LeaderboardSection {
    pub provider: LeaderboardProvider,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageSection {
    pub snapshot_path: Option<String>,
}

fn default_max_participants() -> u32 {
    2
}

fn default_house_rate() -> Decimal {
    dec!(0.5)
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        if config.engine.competition_duration_secs <= 0 {
            anyhow::bail!("engine.competition_duration_secs must be positive");
        }
        if config.grant.stipend == 0 || config.grant.stipend > MAX_GP {
            anyhow::bail!("grant.stipend must be positive and at most {MAX_GP}");
        }
        if config.grant.interval_secs == 0 {
            anyhow::bail!("grant.interval_secs must be positive");
        }
        if config.sweep.interval_secs == 0 {
            anyhow::bail!("sweep.interval_secs must be positive");
        }
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            lifecycle: LifecycleConfig {
                competition_duration: chrono::Duration::seconds(self.engine.competition_duration_secs),
                default_max_participants: self.engine.default_max_participants,
            },
            pool: PoolConfig {
                house_guarantee_rate: self.engine.house_guarantee_rate,
            },
            stipend: self.grant.stipend,
            cadence: self.grant.cadence,
            max_cas_retries: self.engine.max_cas_retries,
        }
    }
}
