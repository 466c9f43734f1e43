//! Anomaly detection over a window of request events.
//!
//! Four independent detectors scan the same immutable slice of events and
//! produce [`Finding`]s. The [`flagger`] turns findings into persisted
//! suspicion records (suppressing repeats) and auto-blocks critical ones, and
//! the [`engine`] orchestrates one run.

pub mod burst;
pub mod engine;
pub mod flagger;
pub mod geographic;
pub mod sensitive_path;
pub mod volume;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::RequestEvent;

#[derive(Debug, Error)]
pub enum DetectError {
    /// The event store could not be read; the whole run is abandoned.
    #[error("event store unavailable: {0}")]
    TransientData(String),

    #[error("detector '{detector}' failed: {message}")]
    DetectorFailure {
        detector: &'static str,
        message: String,
    },

    #[error("failed to persist findings: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Ordinal suspicion level. `Critical` triggers an auto-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        })
    }
}

impl Severity {
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// An unpersisted suspicion signal produced by one detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub address: String,
    pub reason: String,
    pub severity: Severity,
    pub evidence_count: u64,
}

/// A stateless scan over a window of events.
///
/// Implementations must be pure: the same slice always yields the same
/// findings, in the same order.
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    fn scan(&self, events: &[RequestEvent]) -> Result<Vec<Finding>, DetectError>;
}

/// Group events by source address. Ordered by address so detector output is
/// deterministic; per-address events keep their input order.
pub(crate) fn group_by_address(events: &[RequestEvent]) -> BTreeMap<&str, Vec<&RequestEvent>> {
    let mut groups: BTreeMap<&str, Vec<&RequestEvent>> = BTreeMap::new();
    for ev in events {
        groups.entry(ev.address.as_str()).or_default().push(ev);
    }
    groups
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    pub fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    /// `count` requests from `address` to `path`, spaced `step_secs` apart.
    pub fn series(address: &str, path: &str, count: usize, step_secs: i64) -> Vec<RequestEvent> {
        (0..count)
            .map(|i| {
                RequestEvent::new(
                    address,
                    base_time() + Duration::seconds(i as i64 * step_secs),
                    path,
                    "",
                )
            })
            .collect()
    }
}
