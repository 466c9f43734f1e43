//! SQLite storage layer -- schema, connection pool, timestamp encoding.

pub mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::geo::Location;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory for {}", path))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Encode a timestamp for storage.
///
/// Fixed-width RFC 3339 in UTC, so lexical order in SQLite matches
/// chronological order and range queries can compare strings directly.
pub fn to_db_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a timestamp written by [`to_db_time`].
pub fn from_db_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid stored timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

/// Append one inbound request to the request log.
pub fn record_request(
    pool: &Pool,
    address: &str,
    path: &str,
    timestamp: DateTime<Utc>,
    location: &Location,
) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO request_logs
            (address, path, timestamp, country, city, region, latitude, longitude)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            address,
            path,
            to_db_time(timestamp),
            location.country,
            location.city,
            location.region,
            location.latitude,
            location.longitude
        ],
    )
    .context("Failed to insert request log")?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A throwaway on-disk database; keep the `TempDir` alive for the test.
    pub fn temp_pool() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ipwatch.db");
        let pool = open_pool(path.to_str().unwrap()).unwrap();
        (dir, pool)
    }
}
