//! Default schedules, with cron expressions taken from the config file.

use super::{Job, Schedule};
use crate::config::SchedulesConfig;

pub fn defaults(cfg: &SchedulesConfig) -> Vec<Schedule> {
    vec![
        Schedule {
            name: "detect-anomalies".to_string(),
            cron_expr: cfg.detect_anomalies.clone(), // hourly
            job: Job::DetectAnomalies,
            enabled: true,
        },
        Schedule {
            name: "cleanup-logs".to_string(),
            cron_expr: cfg.cleanup_logs.clone(), // daily
            job: Job::CleanupLogs,
            enabled: true,
        },
        Schedule {
            name: "security-report".to_string(),
            cron_expr: cfg.security_report.clone(), // daily
            job: Job::SecurityReport,
            enabled: true,
        },
    ]
}
