use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::denylist::Denylist;
use crate::detect::{Finding, Severity};
use crate::storage::{from_db_time, to_db_time, Pool};

/// A persisted suspicion flag.
#[derive(Debug, Clone, Serialize)]
pub struct SuspicionRecord {
    pub id: i64,
    pub address: String,
    pub reason: String,
    pub severity: Severity,
    pub evidence_count: u64,
    pub flagged_at: DateTime<Utc>,
    pub resolved: bool,
}

/// Store of suspicion flags (`suspicious_ips`).
#[derive(Clone)]
pub struct SuspicionLedger {
    pool: Pool,
}

impl SuspicionLedger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Persist a flag unless the same (address, reason) was flagged within
    /// `suppression` before `now`. Returns true when a record was created.
    ///
    /// Check and insert share one write-locked transaction, so concurrent
    /// callers racing on the same flag see exactly one creation.
    pub fn create_if_absent(
        &self,
        address: &str,
        reason: &str,
        severity: Severity,
        evidence_count: u64,
        now: DateTime<Utc>,
        suppression: Duration,
    ) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let recent: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM suspicious_ips
                WHERE address = ?1 AND reason = ?2 AND flagged_at >= ?3)",
            params![address, reason, to_db_time(now - suppression)],
            |row| row.get(0),
        )?;
        if recent {
            return Ok(false);
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO suspicious_ips
                (address, reason, severity, evidence_count, flagged_at, resolved)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                address,
                reason,
                severity.to_string(),
                evidence_count as i64,
                to_db_time(now)
            ],
        )?;
        tx.commit().context("Failed to commit suspicion flag")?;

        Ok(inserted == 1)
    }

    /// Most recent flags first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<SuspicionRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, address, reason, severity, evidence_count, flagged_at, resolved
             FROM suspicious_ips ORDER BY flagged_at DESC, id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, bool>(6)?,
            ))
        })?;

        let mut records = Vec::new();
        for r in rows {
            let (id, address, reason, severity, evidence_count, flagged_at, resolved) = r?;
            records.push(SuspicionRecord {
                id,
                address,
                reason,
                severity: Severity::from_str_name(&severity).unwrap_or(Severity::Low),
                evidence_count: evidence_count as u64,
                flagged_at: from_db_time(&flagged_at)?,
                resolved,
            });
        }
        Ok(records)
    }

    /// Operator action. Returns false if no such record exists.
    pub fn mark_resolved(&self, id: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE suspicious_ips SET resolved = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(changed > 0)
    }

    pub fn count_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM suspicious_ips WHERE flagged_at >= ?1",
            params![to_db_time(since)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

/// Turns findings into suspicion records and auto-blocks critical ones.
#[derive(Clone)]
pub struct FlagWriter {
    ledger: SuspicionLedger,
    denylist: Denylist,
    suppression: Duration,
}

impl FlagWriter {
    pub fn new(ledger: SuspicionLedger, denylist: Denylist, suppression: Duration) -> Self {
        Self {
            ledger,
            denylist,
            suppression,
        }
    }

    /// Persist findings in order. Returns the number of new records; findings
    /// suppressed by an earlier flag are not counted.
    ///
    /// Every critical finding is enforced, suppressed or not, so a block that
    /// failed after its flag was committed is retried on the next run.
    pub fn write(&self, findings: &[Finding], now: DateTime<Utc>) -> Result<usize> {
        let mut created = 0;

        for finding in findings {
            let is_new = self.ledger.create_if_absent(
                &finding.address,
                &finding.reason,
                finding.severity,
                finding.evidence_count,
                now,
                self.suppression,
            )?;

            if is_new {
                created += 1;
                warn!(
                    address = %finding.address,
                    reason = %finding.reason,
                    severity = %finding.severity,
                    "flagged suspicious address"
                );
            } else {
                debug!(address = %finding.address, reason = %finding.reason, "flag suppressed");
            }

            if finding.severity == Severity::Critical {
                self.auto_block(finding)?;
            }
        }

        Ok(created)
    }

    fn auto_block(&self, finding: &Finding) -> Result<()> {
        let reason = format!("auto-blocked: {}", finding.reason);
        let outcome = self.denylist.ensure_blocked(&finding.address, &reason)?;
        if outcome.is_new() {
            error!(address = %finding.address, "auto-blocked critical threat address");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::temp_pool;

    fn writer() -> (tempfile::TempDir, FlagWriter, SuspicionLedger, Denylist) {
        let (dir, pool) = temp_pool();
        let ledger = SuspicionLedger::new(pool.clone());
        let denylist = Denylist::new(pool, std::time::Duration::from_secs(300));
        let writer = FlagWriter::new(ledger.clone(), denylist.clone(), Duration::hours(6));
        (dir, writer, ledger, denylist)
    }

    fn finding(address: &str, reason: &str, severity: Severity) -> Finding {
        Finding {
            address: address.to_string(),
            reason: reason.to_string(),
            severity,
            evidence_count: 42,
        }
    }

    #[test]
    fn test_repeat_within_window_suppressed() {
        let (_dir, writer, ledger, _) = writer();
        let now = Utc::now();
        let f = finding("192.0.2.50", "excessive requests: 150 requests/hour", Severity::Medium);

        assert_eq!(writer.write(&[f.clone()], now).unwrap(), 1);
        assert_eq!(writer.write(&[f.clone()], now + Duration::hours(5)).unwrap(), 0);
        assert_eq!(ledger.list_recent(10).unwrap().len(), 1);
    }

    #[test]
    fn test_repeat_after_window_persisted() {
        let (_dir, writer, ledger, _) = writer();
        let now = Utc::now();
        let f = finding("192.0.2.51", "same reason", Severity::Low);

        writer.write(&[f.clone()], now).unwrap();
        assert_eq!(writer.write(&[f], now + Duration::hours(7)).unwrap(), 1);
        assert_eq!(ledger.list_recent(10).unwrap().len(), 2);
    }

    #[test]
    fn test_duplicates_in_one_batch_count_once() {
        let (_dir, writer, _, _) = writer();
        let f = finding("192.0.2.52", "dup", Severity::Medium);
        assert_eq!(writer.write(&[f.clone(), f], Utc::now()).unwrap(), 1);
    }

    #[test]
    fn test_different_reasons_not_suppressed() {
        let (_dir, writer, _, _) = writer();
        let findings = vec![
            finding("192.0.2.53", "reason a", Severity::Medium),
            finding("192.0.2.53", "reason b", Severity::Medium),
        ];
        assert_eq!(writer.write(&findings, Utc::now()).unwrap(), 2);
    }

    #[test]
    fn test_two_critical_findings_one_block() {
        let (_dir, writer, _, denylist) = writer();
        let findings = vec![
            finding("192.0.2.54", "critical one", Severity::Critical),
            finding("192.0.2.54", "critical two", Severity::Critical),
        ];

        assert_eq!(writer.write(&findings, Utc::now()).unwrap(), 2);

        let blocks = denylist.list_active().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].reason, "auto-blocked: critical one");
        assert!(denylist.is_blocked("192.0.2.54").unwrap());
    }

    #[test]
    fn test_non_critical_never_blocks() {
        let (_dir, writer, _, denylist) = writer();
        writer
            .write(&[finding("192.0.2.55", "high", Severity::High)], Utc::now())
            .unwrap();
        assert_eq!(denylist.active_count().unwrap(), 0);
    }

    #[test]
    fn test_mark_resolved() {
        let (_dir, writer, ledger, _) = writer();
        writer
            .write(&[finding("192.0.2.56", "r", Severity::Low)], Utc::now())
            .unwrap();
        let id = ledger.list_recent(1).unwrap()[0].id;

        assert!(ledger.mark_resolved(id).unwrap());
        assert!(ledger.list_recent(1).unwrap()[0].resolved);
        assert!(!ledger.mark_resolved(id + 100).unwrap());
    }

    #[test]
    fn test_failed_auto_block_retried_on_suppressed_repeat() {
        let (_dir, pool) = temp_pool();
        let ledger = SuspicionLedger::new(pool.clone());
        let denylist = Denylist::new(pool.clone(), std::time::Duration::from_secs(300));
        let writer = FlagWriter::new(ledger.clone(), denylist.clone(), Duration::hours(6));
        let f = finding("192.0.2.57", "excessive requests: 900 requests/hour", Severity::Critical);
        let now = Utc::now();

        pool.get()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_block BEFORE INSERT ON blocked_ips
                 BEGIN SELECT RAISE(ABORT, 'transient'); END;",
            )
            .unwrap();
        assert!(writer.write(&[f.clone()], now).is_err());
        assert_eq!(ledger.list_recent(10).unwrap().len(), 1);
        assert!(!denylist.is_blocked("192.0.2.57").unwrap());

        pool.get()
            .unwrap()
            .execute_batch("DROP TRIGGER fail_block;")
            .unwrap();
        assert_eq!(writer.write(&[f], now + Duration::hours(1)).unwrap(), 0);

        let blocks = denylist.list_active().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].address, "192.0.2.57");
        assert!(denylist.is_blocked("192.0.2.57").unwrap());
        assert_eq!(ledger.list_recent(10).unwrap().len(), 1);
    }

    #[test]
    fn test_suppressed_critical_does_not_duplicate_block() {
        let (_dir, writer, _, denylist) = writer();
        let f = finding("192.0.2.58", "critical", Severity::Critical);
        let now = Utc::now();

        assert_eq!(writer.write(&[f.clone()], now).unwrap(), 1);
        assert_eq!(writer.write(&[f], now + Duration::minutes(60)).unwrap(), 0);

        let blocks = denylist.list_active().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].reason, "auto-blocked: critical");
    }

    #[test]
    fn test_concurrent_create_if_absent_creates_once() {
        let (_dir, pool) = temp_pool();
        let ledger = SuspicionLedger::new(pool);
        let now = Utc::now();
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    ledger
                        .create_if_absent(
                            "192.0.2.59",
                            "rapid fire requests: 30 requests in 5 minutes",
                            Severity::Medium,
                            30,
                            now,
                            Duration::hours(6),
                        )
                        .unwrap()
                })
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&new| new)
            .count();

        assert_eq!(created, 1);
        assert_eq!(ledger.list_recent(10).unwrap().len(), 1);
    }
}
