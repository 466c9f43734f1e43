//! Database schema and migrations.

use anyhow::Result;
use rusqlite::{params, Connection};

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS request_logs (
            id INTEGER PRIMARY KEY,
            address TEXT NOT NULL,
            path TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            country TEXT NOT NULL DEFAULT '',
            city TEXT NOT NULL DEFAULT '',
            region TEXT NOT NULL DEFAULT '',
            latitude REAL,
            longitude REAL
        );

        CREATE TABLE IF NOT EXISTS suspicious_ips (
            id INTEGER PRIMARY KEY,
            address TEXT NOT NULL,
            reason TEXT NOT NULL,
            severity TEXT NOT NULL,
            evidence_count INTEGER NOT NULL,
            flagged_at TEXT NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            UNIQUE (address, reason, flagged_at)
        );

        CREATE TABLE IF NOT EXISTS blocked_ips (
            id INTEGER PRIMARY KEY,
            address TEXT NOT NULL UNIQUE,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS schedules (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            cron_expr TEXT NOT NULL,
            job TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_run_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS schedule_history (
            id TEXT PRIMARY KEY,
            schedule_name TEXT NOT NULL,
            status TEXT NOT NULL,
            result_summary TEXT,
            duration_us INTEGER,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            FOREIGN KEY (schedule_name) REFERENCES schedules(name) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_request_logs_timestamp ON request_logs(timestamp);
        CREATE INDEX IF NOT EXISTS idx_request_logs_address ON request_logs(address);
        CREATE INDEX IF NOT EXISTS idx_suspicious_lookup
            ON suspicious_ips(address, reason, flagged_at);
        CREATE INDEX IF NOT EXISTS idx_schedule_history_name ON schedule_history(schedule_name);",
    )?;

    // Databases created before coordinates were logged.
    add_column_if_missing(conn, "request_logs", "latitude", "REAL")?;
    add_column_if_missing(conn, "request_logs", "longitude", "REAL")?;

    Ok(())
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2)",
        params![table, column],
        |row| row.get(0),
    )?;
    if !exists {
        conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {};", table, column, decl))?;
    }
    Ok(())
}
