//! Request event log -- the read side the anomaly engine consumes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{from_db_time, to_db_time, Pool};

/// One logged inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub address: String,
    pub timestamp: DateTime<Utc>,
    pub path: String,
    /// Country name from geolocation; empty when unknown.
    pub country: String,
}

impl RequestEvent {
    pub fn new(
        address: impl Into<String>,
        timestamp: DateTime<Utc>,
        path: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            timestamp,
            path: path.into(),
            country: country.into(),
        }
    }

    /// Events without a source address cannot be attributed and are skipped.
    pub fn is_valid(&self) -> bool {
        !self.address.trim().is_empty()
    }
}

/// Source of request events for a time window.
pub trait EventStore: Send + Sync {
    /// Events with `start <= timestamp <= end`, ordered by timestamp ascending.
    fn events_in_window(&self, start: DateTime<Utc>, end: DateTime<Utc>)
        -> Result<Vec<RequestEvent>>;
}

/// Event store backed by the `request_logs` table.
#[derive(Clone)]
pub struct SqliteEventStore {
    pool: Pool,
}

impl SqliteEventStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl EventStore for SqliteEventStore {
    fn events_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RequestEvent>> {
        let conn = self.pool.get().context("Failed to get DB connection")?;
        let mut stmt = conn.prepare(
            "SELECT address, timestamp, path, country FROM request_logs
             WHERE timestamp >= ?1 AND timestamp <= ?2
             ORDER BY timestamp ASC, id ASC",
        )?;

        let rows = stmt.query_map(
            rusqlite::params![to_db_time(start), to_db_time(end)],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )?;

        let mut events = Vec::new();
        for r in rows {
            let (address, ts, path, country) = r?;
            events.push(RequestEvent {
                address,
                timestamp: from_db_time(&ts)?,
                path,
                country,
            });
        }
        Ok(events)
    }
}
