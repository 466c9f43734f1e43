use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::params;
use serde::Serialize;
use tracing::info;

use crate::denylist::Denylist;
use crate::detect::flagger::SuspicionLedger;
use crate::storage::{to_db_time, Pool};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CountryCount {
    pub country: String,
    pub count: u64,
}

/// Traffic and enforcement totals for the 24 hours before the report time.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityReport {
    pub date: NaiveDate,
    pub total_requests: u64,
    pub unique_ips: u64,
    pub blocked_ips: u64,
    pub suspicious_flags: u64,
    pub top_countries: Vec<CountryCount>,
}

pub fn generate_security_report(pool: &Pool, now: DateTime<Utc>) -> Result<SecurityReport> {
    let since = now - Duration::days(1);
    let blocked_ips = Denylist::new(pool.clone(), std::time::Duration::ZERO).active_count()?;
    let suspicious_flags = SuspicionLedger::new(pool.clone()).count_since(since)?;

    let conn = pool.get()?;

    let (total_requests, unique_ips): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COUNT(DISTINCT address) FROM request_logs WHERE timestamp >= ?1",
        params![to_db_time(since)],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let mut stmt = conn.prepare(
        "SELECT country, COUNT(*) AS n FROM request_logs
         WHERE timestamp >= ?1 AND country != ''
         GROUP BY country ORDER BY n DESC, country ASC LIMIT 5",
    )?;
    let top_countries = stmt
        .query_map(params![to_db_time(since)], |row| {
            Ok(CountryCount {
                country: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let report = SecurityReport {
        date: since.date_naive(),
        total_requests: total_requests as u64,
        unique_ips: unique_ips as u64,
        blocked_ips,
        suspicious_flags,
        top_countries,
    };
    info!(
        total_requests = report.total_requests,
        unique_ips = report.unique_ips,
        blocked_ips = report.blocked_ips,
        suspicious_flags = report.suspicious_flags,
        "Security report generated"
    );
    Ok(report)
}
