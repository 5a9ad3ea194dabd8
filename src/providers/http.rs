//! HTTP leaderboard provider.
//!
//! Fetches rank/score snapshots from a leaderboard service.
//!
//! Endpoint: `GET {base_url}/leaderboards/{ref}/entries`
//! Response: `[{"participantKey": "...", "rank": 1, "score": 1234.5}, ...]`
//! Auth: optional `Authorization: Bearer {key}`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use tracing::debug;

use super::{LeaderboardEntry, LeaderboardSnapshot};

pub struct HttpLeaderboard {
    http: Client,
    base_url: String,
    api_key: Option<Secret<String>>,
}

impl HttpLeaderboard {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .user_agent("WAGERBOOK/0.1.0 (leaderboard-client)")
            .build()
            .context("Failed to build HTTP client for leaderboard")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(Secret::new),
        })
    }

    fn entries_url(&self, leaderboard_ref: &str) -> String {
        format!(
            "{}/leaderboards/{}/entries",
            self.base_url,
            urlencoding::encode(leaderboard_ref)
        )
    }

    /// Parse and sanity-check a response body.
    fn parse_entries(body: &str) -> Result<Vec<LeaderboardEntry>> {
        let mut entries: Vec<LeaderboardEntry> =
            serde_json::from_str(body).context("Failed to parse leaderboard entries")?;
        entries.retain(|e| !e.participant_key.is_empty() && e.rank > 0);
        Ok(entries)
    }
}

#[async_trait]
impl LeaderboardSnapshot for HttpLeaderboard {
    async fn get_entries(&self, leaderboard_ref: &str) -> Result<Vec<LeaderboardEntry>> {
        let url = self.entries_url(leaderboard_ref);
        debug!(url = %url, "Fetching leaderboard snapshot");

        let mut req = self.http.get(&url);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req.send().await.context("Leaderboard request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Leaderboard API error {status}: {body}");
        }

        let body = resp.text().await.context("Failed to read leaderboard response")?;
        let entries = Self::parse_entries(&body)?;
        debug!(leaderboard_ref, count = entries.len(), "Leaderboard snapshot fetched");
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
