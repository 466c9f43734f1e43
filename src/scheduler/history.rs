//! Execution history tracking for scheduled runs.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use crate::storage::{from_db_time, to_db_time, Pool};

/// A record of a scheduled job execution.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub schedule_name: String,
    pub status: RunStatus,
    pub result_summary: Option<String>,
    pub duration_us: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

pub fn record(pool: &Pool, entry: &HistoryEntry) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO schedule_history
            (id, schedule_name, status, result_summary, duration_us, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.id.to_string(),
            entry.schedule_name,
            entry.status.as_str(),
            entry.result_summary,
            entry.duration_us as i64,
            to_db_time(entry.started_at),
            entry.finished_at.map(to_db_time),
        ],
    )?;
    Ok(())
}

/// Newest runs of one schedule first.
pub fn recent(pool: &Pool, schedule_name: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, status, result_summary, duration_us, started_at, finished_at
         FROM schedule_history WHERE schedule_name = ?1
         ORDER BY started_at DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![schedule_name, limit as i64], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;

    let mut entries = Vec::new();
    for r in rows {
        let (id, status, result_summary, duration_us, started_at, finished_at) = r?;
        entries.push(HistoryEntry {
            id: Uuid::parse_str(&id)?,
            schedule_name: schedule_name.to_string(),
            status: if status == "success" {
                RunStatus::Success
            } else {
                RunStatus::Failed
            },
            result_summary,
            duration_us: duration_us as u64,
            started_at: from_db_time(&started_at)?,
            finished_at: finished_at.as_deref().map(from_db_time).transpose()?,
        });
    }
    Ok(entries)
}
