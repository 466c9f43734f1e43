use chrono::{DateTime, Utc};

use crate::config::BurstConfig;
use crate::detect::{group_by_address, DetectError, Detector, Finding, Severity};
use crate::events::RequestEvent;

/// Flags rapid-fire bursts: too many requests from one address inside a short
/// window.
///
/// For each address (with at least `min_events` requests) the timestamps are
/// sorted and every request opens a window `[t, t + window)`. The first window
/// holding more than `threshold` requests produces the finding; later, possibly
/// larger, windows are not considered.
#[derive(Debug, Clone, Default)]
pub struct BurstDetector {
    cfg: BurstConfig,
}

impl BurstDetector {
    pub fn new(cfg: BurstConfig) -> Self {
        Self { cfg }
    }

    /// Size of the first over-threshold window, scanning in timestamp order.
    ///
    /// `stamps` must be sorted ascending. Both window edges only move forward,
    /// so the scan is linear after the sort.
    fn first_burst(&self, stamps: &[DateTime<Utc>]) -> Option<usize> {
        let window = self.cfg.window();
        let mut end = 0;

        for start in 0..stamps.len() {
            // Equal start times open the same window; the first of the run
            // already evaluated it.
            if start > 0 && stamps[start] == stamps[start - 1] {
                continue;
            }

            let limit = stamps[start] + window;
            end = end.max(start);
            while end < stamps.len() && stamps[end] < limit {
                end += 1;
            }

            let count = end - start;
            if count > self.cfg.threshold {
                return Some(count);
            }
        }

        None
    }
}

/// Whole minutes when the window divides evenly, seconds otherwise.
fn window_label(secs: u64) -> String {
    if secs >= 60 && secs % 60 == 0 {
        format!("{} minutes", secs / 60)
    } else {
        format!("{} seconds", secs)
    }
}

impl Detector for BurstDetector {
    fn name(&self) -> &'static str {
        "burst"
    }

    fn scan(&self, events: &[RequestEvent]) -> Result<Vec<Finding>, DetectError> {
        let mut findings = Vec::new();

        for (address, evs) in group_by_address(events) {
            if evs.len() < self.cfg.min_events {
                continue;
            }

            let mut stamps: Vec<DateTime<Utc>> = evs.iter().map(|ev| ev.timestamp).collect();
            stamps.sort();

            if let Some(count) = self.first_burst(&stamps) {
                findings.push(Finding {
                    address: address.to_string(),
                    reason: format!(
                        "rapid fire requests: {} requests in {}",
                        count,
                        window_label(self.cfg.window_secs)
                    ),
                    severity: Severity::Medium,
                    evidence_count: count as u64,
                });
            }
        }

        Ok(findings)
    }
}
