use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::checked_period;
use crate::storage::{to_db_time, Pool};

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub deleted_logs: usize,
    pub cutoff: DateTime<Utc>,
}

/// Delete request logs older than `days` before `now`.
///
/// Suspicion and block records are left alone.
pub fn cleanup_old_logs(pool: &Pool, now: DateTime<Utc>, days: u64) -> Result<CleanupReport> {
    if days == 0 {
        bail!("retention must be at least one day");
    }
    let cutoff = checked_period(days, 86_400)
        .and_then(|period| now.checked_sub_signed(period))
        .with_context(|| format!("retention of {} days is out of range", days))?;
    let conn = pool.get()?;
    let deleted_logs = conn
        .execute(
            "DELETE FROM request_logs WHERE timestamp < ?1",
            rusqlite::params![to_db_time(cutoff)],
        )
        .context("Failed to purge request logs")?;

    info!(deleted = deleted_logs, cutoff = %cutoff, "Cleaned up old request logs");
    Ok(CleanupReport {
        deleted_logs,
        cutoff,
    })
}
