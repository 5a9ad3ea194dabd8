//! Periodic stipend.
//!
//! Every account is credited once per grant period. The credit and the
//! period marker are written together by `Ledger::grant`, so overlapping
//! runs for the same period (a manual trigger racing the schedule, or a
//! retried job) never pay an account twice.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ledger::Ledger;
use crate::types::{AccountId, Gp, GrantPeriod, LedgerEntry, WagerError};

/// How often a new grant period begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantCadence {
    Daily,
    Weekly,
    #[default]
    Monthly,
}

impl GrantCadence {
    /// The period containing `at`: `2025-03-14`, `2025-W11` or `2025-03`.
    pub fn period_for(&self, at: DateTime<Utc>) -> GrantPeriod {
        match self {
            GrantCadence::Daily => GrantPeriod::new(at.format("%Y-%m-%d").to_string()),
            GrantCadence::Weekly => {
                let week = at.iso_week();
                GrantPeriod::new(format!("{}-W{:02}", week.year(), week.week()))
            }
            GrantCadence::Monthly => GrantPeriod::new(at.format("%Y-%m").to_string()),
        }
    }
}

/// Summary of one grant run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrantReport {
    pub period: GrantPeriod,
    pub credited: Vec<AccountId>,
    pub skipped: usize,
    pub failed: Vec<(AccountId, String)>,
    pub total_issued: Gp,
}

#[derive(Clone)]
pub struct PeriodicGrant {
    ledger: Ledger,
    stipend: Gp,
}

impl PeriodicGrant {
    pub fn new(ledger: Ledger, stipend: Gp) -> Self {
        Self { ledger, stipend }
    }

    pub fn stipend(&self) -> Gp {
        self.stipend
    }

    /// Credit the stipend to every account not yet granted for `period`.
    /// A failure on one account is recorded and the run carries on.
    pub async fn run(&self, period: &GrantPeriod) -> Result<GrantReport, WagerError> {
        let accounts = self.ledger.accounts().await?;
        let mut report = GrantReport {
            period: period.clone(),
            credited: Vec::new(),
            skipped: 0,
            failed: Vec::new(),
            total_issued: 0,
        };

        for account in accounts {
            match self.ledger.grant(&account.id, period, self.stipend, false).await {
                Ok(Some(entry)) => {
                    report.total_issued += entry.amount.unsigned_abs();
                    report.credited.push(account.id);
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!(account = %account.id, period = %period, error = %e, "Grant failed");
                    report.failed.push((account.id, e.to_string()));
                }
            }
        }

        info!(
            period = %period,
            credited = report.credited.len(),
            skipped = report.skipped,
            failed = report.failed.len(),
            total_issued = report.total_issued,
            "Periodic grant complete"
        );
        Ok(report)
    }

    /// Administrative override: credit `account` for `period` even if it
    /// was already granted.
    pub async fn force_grant(
        &self,
        account: &AccountId,
        period: &GrantPeriod,
    ) -> Result<LedgerEntry, WagerError> {
        let entry = self
            .ledger
            .grant(account, period, self.stipend, true)
            .await?
            .ok_or_else(|| WagerError::Storage("forced grant produced no entry".to_string()))?;
        warn!(account = %account, period = %period, amount = self.stipend, "Stipend force-granted");
        Ok(entry)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
