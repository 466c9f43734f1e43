use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use super::history::{self, HistoryEntry, RunStatus};
use super::{Job, Scheduler};
use crate::detect::engine::AnomalyEngine;
use crate::housekeeping;
use crate::storage::Pool;

/// Executes scheduled jobs. Each run returns a JSON summary for the history table.
pub struct JobRunner {
    pool: Pool,
    engine: Arc<AnomalyEngine>,
    retention_days: u64,
}

impl JobRunner {
    pub fn new(pool: Pool, engine: Arc<AnomalyEngine>, retention_days: u64) -> Self {
        Self {
            pool,
            engine,
            retention_days,
        }
    }

    pub async fn run(&self, job: Job) -> Result<String> {
        let now = Utc::now();
        let value = match job {
            Job::DetectAnomalies => serde_json::to_value(self.engine.run_at(now).await?)?,
            Job::CleanupLogs => {
                let pool = self.pool.clone();
                let days = self.retention_days;
                let report = tokio::task::spawn_blocking(move || {
                    housekeeping::cleanup_old_logs(&pool, now, days)
                })
                .await??;
                serde_json::to_value(report)?
            }
            Job::SecurityReport => {
                let pool = self.pool.clone();
                let report = tokio::task::spawn_blocking(move || {
                    housekeeping::generate_security_report(&pool, now)
                })
                .await??;
                serde_json::to_value(report)?
            }
        };
        Ok(value.to_string())
    }
}

/// Main scheduler execution loop.
/// Polls for due schedules every `poll_interval` and runs each on its own task.
pub async fn run_scheduler_loop(
    scheduler: Scheduler,
    runner: Arc<JobRunner>,
    poll_interval: Duration,
) {
    info!(poll_secs = poll_interval.as_secs(), "Scheduler engine started");

    let mut interval = tokio::time::interval(poll_interval);

    loop {
        interval.tick().await;

        let checker = scheduler.clone();
        let due = tokio::task::spawn_blocking(move || checker.check_due_tasks(Utc::now())).await;
        let tasks = match due {
            Ok(Ok(tasks)) => tasks,
            Ok(Err(e)) => {
                error!("Failed to check due tasks: {:#}", e);
                continue;
            }
            Err(e) => {
                error!("Due-task check panicked: {}", e);
                continue;
            }
        };

        for (name, job) in tasks {
            info!(schedule = %name, job = %job, "Task due");
            let scheduler = scheduler.clone();
            let runner = runner.clone();
            tokio::spawn(async move {
                execute(scheduler, runner, name, job).await;
            });
        }
    }
}

async fn execute(scheduler: Scheduler, runner: Arc<JobRunner>, name: String, job: Job) {
    let started_at = Utc::now();

    // Mark as run BEFORE execution to prevent double-scheduling
    let marker = scheduler.clone();
    let marked_name = name.clone();
    let marked =
        tokio::task::spawn_blocking(move || marker.update_last_run(&marked_name, started_at)).await;
    if !matches!(marked, Ok(Ok(()))) {
        error!(schedule = %name, "Failed to update last_run, skipping run");
        return;
    }

    let clock = Instant::now();
    let result = runner.run(job).await;
    let duration_us = clock.elapsed().as_micros() as u64;

    let (status, result_summary) = match result {
        Ok(summary) => {
            info!(schedule = %name, job = %job, duration_us, "Job finished");
            (RunStatus::Success, summary)
        }
        Err(e) => {
            error!(schedule = %name, job = %job, "Job failed: {:#}", e);
            (RunStatus::Failed, format!("{:#}", e))
        }
    };

    let entry = HistoryEntry {
        id: Uuid::new_v4(),
        schedule_name: name.clone(),
        status,
        result_summary: Some(result_summary),
        duration_us,
        started_at,
        finished_at: Some(Utc::now()),
    };
    let pool = scheduler.get_pool().clone();
    match tokio::task::spawn_blocking(move || history::record(&pool, &entry)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(schedule = %name, "Failed to save run history: {:#}", e),
        Err(e) => error!(schedule = %name, "History writer panicked: {}", e),
    }
}
