//! Cron-driven background jobs persisted in SQLite.

pub mod cron;
pub mod engine;
pub mod history;
pub mod profiles;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use self::cron::Scheduler;
pub use self::engine::{run_scheduler_loop, JobRunner};

/// Work a schedule can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Job {
    DetectAnomalies,
    CleanupLogs,
    SecurityReport,
}

impl Job {
    pub const ALL: [Job; 3] = [Job::DetectAnomalies, Job::CleanupLogs, Job::SecurityReport];

    pub fn as_str(&self) -> &'static str {
        match self {
            Job::DetectAnomalies => "detect-anomalies",
            Job::CleanupLogs => "cleanup-logs",
            Job::SecurityReport => "security-report",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|job| job.as_str() == s)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A stored schedule.
#[derive(Debug, Clone, Serialize)]
pub struct Schedule {
    pub name: String,
    pub cron_expr: String,
    pub job: Job,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_names_roundtrip() {
        for job in Job::ALL {
            assert_eq!(Job::from_str_name(job.as_str()), Some(job));
        }
        assert_eq!(Job::from_str_name("icmp"), None);
    }
}
