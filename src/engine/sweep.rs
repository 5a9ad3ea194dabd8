//! Expiry sweep: resolves every active competition past its end time.
//!
//! Competitions are independent, so they resolve concurrently. A failure
//! (leaderboard down, write conflict) leaves the competition `Active` and
//! it is picked up again on the next tick.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use super::lifecycle::CompetitionLifecycle;
use crate::types::{CompetitionId, CompetitionState, WagerError};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub completed: Vec<CompetitionId>,
    pub cancelled: Vec<CompetitionId>,
    pub failed: Vec<(CompetitionId, String)>,
}

pub async fn sweep(lifecycle: &CompetitionLifecycle, now: DateTime<Utc>) -> Result<SweepReport, WagerError> {
    let expired = lifecycle.expired(now).await?;
    let mut report = SweepReport {
        expired: expired.len(),
        ..SweepReport::default()
    };
    if expired.is_empty() {
        return Ok(report);
    }

    let results = join_all(
        expired
            .iter()
            .map(|c| async move { (c.id, lifecycle.resolve_expired(&c.id, now).await) }),
    )
    .await;

    for (id, result) in results {
        match result {
            Ok(c) if c.state == CompetitionState::Completed => report.completed.push(id),
            Ok(_) => report.cancelled.push(id),
            Err(e) => {
                warn!(competition_id = %id, error = %e, transient = e.is_transient(), "Expired competition not resolved");
                report.failed.push((id, e.to_string()));
            }
        }
    }

    info!(
        expired = report.expired,
        completed = report.completed.len(),
        cancelled = report.cancelled.len(),
        failed = report.failed.len(),
        "Expiry sweep complete"
    );
    Ok(report)
}
