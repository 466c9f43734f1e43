use std::str::FromStr;

use ::cron::Schedule as CronSchedule;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::{info, warn};

use super::{Job, Schedule};
use crate::storage::{from_db_time, to_db_time, Pool};

/// A scheduler that persists tasks in SQLite and checks for runnable tasks.
#[derive(Clone)]
pub struct Scheduler {
    pool: Pool,
}

fn parse_cron(expr: &str) -> Result<CronSchedule> {
    CronSchedule::from_str(expr)
        .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expr, e))
}

impl Scheduler {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn get_pool(&self) -> &Pool {
        &self.pool
    }

    /// Add a new schedule to the database
    pub fn add_schedule(&self, name: &str, cron_expr: &str, job: Job) -> Result<()> {
        parse_cron(cron_expr)?;

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO schedules (name, cron_expr, job, enabled, created_at)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![name, cron_expr, job.as_str(), to_db_time(Utc::now())],
        )
        .with_context(|| format!("Failed to insert schedule '{}'", name))?;

        Ok(())
    }

    /// Insert any default schedule whose name is not taken yet. Operator
    /// edits to existing rows are preserved.
    pub fn ensure_defaults(&self, defaults: &[Schedule]) -> Result<usize> {
        let conn = self.pool.get()?;
        let mut added = 0;
        for s in defaults {
            parse_cron(&s.cron_expr)?;
            added += conn.execute(
                "INSERT OR IGNORE INTO schedules (name, cron_expr, job, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![s.name, s.cron_expr, s.job.as_str(), s.enabled, to_db_time(Utc::now())],
            )?;
        }
        if added > 0 {
            info!(added, "Installed default schedules");
        }
        Ok(added)
    }

    /// List all schedules
    pub fn list(&self) -> Result<Vec<Schedule>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT name, cron_expr, job, enabled FROM schedules ORDER BY name")?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
            ))
        })?;

        let mut list = Vec::new();
        for r in rows {
            let (name, cron_expr, job, enabled) = r?;
            match Job::from_str_name(&job) {
                Some(job) => list.push(Schedule {
                    name,
                    cron_expr,
                    job,
                    enabled,
                }),
                None => warn!(schedule = %name, job = %job, "Skipping schedule with unknown job"),
            }
        }
        Ok(list)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM schedules WHERE name = ?1", params![name])?;
        if changed == 0 {
            anyhow::bail!("Schedule '{}' not found", name);
        }
        Ok(())
    }

    /// Calculate next run times for all enabled schedules.
    /// This is strictly a dry-run preview, not the execution loop.
    pub fn preview_next_runs(
        &self,
        now: DateTime<Utc>,
        hours: u64,
    ) -> Result<Vec<(DateTime<Utc>, String, Job)>> {
        let end = now + chrono::Duration::hours(hours as i64);
        let mut preview = Vec::new();

        for s in self.list()?.into_iter().filter(|s| s.enabled) {
            let Ok(schedule) = parse_cron(&s.cron_expr) else {
                continue;
            };
            for next_time in schedule.after(&now) {
                if next_time > end {
                    break;
                }
                preview.push((next_time, s.name.clone(), s.job));
            }
        }

        preview.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(preview)
    }

    /// Enabled schedules whose next fire time after their last run (or
    /// creation) is at or before `now`. Missed fires collapse into one run.
    pub fn check_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<(String, Job)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT name, cron_expr, job, COALESCE(last_run_at, created_at)
             FROM schedules WHERE enabled = 1 ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut due = Vec::new();
        for r in rows {
            let (name, cron_expr, job, reference) = r?;
            let (Some(job), Ok(schedule)) = (Job::from_str_name(&job), parse_cron(&cron_expr))
            else {
                warn!(schedule = %name, "Skipping unrunnable schedule");
                continue;
            };
            let reference = from_db_time(&reference).unwrap_or(now);
            if schedule.after(&reference).next().is_some_and(|next| next <= now) {
                due.push((name, job));
            }
        }
        Ok(due)
    }

    pub fn update_last_run(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE schedules SET last_run_at = ?1 WHERE name = ?2",
            params![to_db_time(at), name],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulesConfig;
    use crate::scheduler::profiles;
    use crate::storage::test_support::temp_pool;
    use chrono::{Duration, TimeZone};

    fn scheduler() -> (tempfile::TempDir, Scheduler) {
        let (dir, pool) = temp_pool();
        (dir, Scheduler::new(pool))
    }

    #[test]
    fn test_add_rejects_bad_cron() {
        let (_dir, s) = scheduler();
        let err = s.add_schedule("bad", "every hour", Job::CleanupLogs).unwrap_err();
        assert!(err.to_string().contains("Invalid cron expression"));
    }

    #[test]
    fn test_add_list_remove() {
        let (_dir, s) = scheduler();
        s.add_schedule("nightly", "0 0 2 * * *", Job::CleanupLogs).unwrap();

        let list = s.list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].job, Job::CleanupLogs);

        s.remove("nightly").unwrap();
        assert!(s.list().unwrap().is_empty());
        assert!(s.remove("nightly").is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (_dir, s) = scheduler();
        s.add_schedule("x", "0 0 * * * *", Job::SecurityReport).unwrap();
        assert!(s.add_schedule("x", "0 0 * * * *", Job::SecurityReport).is_err());
    }

    #[test]
    fn test_ensure_defaults_is_idempotent() {
        let (_dir, s) = scheduler();
        let defaults = profiles::defaults(&SchedulesConfig::default());
        assert_eq!(s.ensure_defaults(&defaults).unwrap(), 3);
        assert_eq!(s.ensure_defaults(&defaults).unwrap(), 0);
        assert_eq!(s.list().unwrap().len(), 3);
    }

    #[test]
    fn test_preview_hourly() {
        let (_dir, s) = scheduler();
        s.add_schedule("hourly", "0 0 * * * *", Job::DetectAnomalies).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();

        let preview = s.preview_next_runs(now, 3).unwrap();
        let times: Vec<_> = preview.iter().map(|p| p.0).collect();
        assert_eq!(
            times,
            vec![
                Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn test_due_after_fire_time_then_not_again() {
        let (_dir, s) = scheduler();
        s.add_schedule("hourly", "0 0 * * * *", Job::DetectAnomalies).unwrap();
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        s.update_last_run("hourly", base).unwrap();

        assert!(s.check_due_tasks(base + Duration::minutes(10)).unwrap().is_empty());

        let fire = base + Duration::minutes(30);
        let due = s.check_due_tasks(fire).unwrap();
        assert_eq!(due, vec![("hourly".to_string(), Job::DetectAnomalies)]);

        s.update_last_run("hourly", fire).unwrap();
        assert!(s.check_due_tasks(fire + Duration::seconds(10)).unwrap().is_empty());
    }
}
