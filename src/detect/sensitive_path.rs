use crate::config::SensitivePathConfig;
use crate::detect::{group_by_address, DetectError, Detector, Finding, Severity};
use crate::events::RequestEvent;

/// Flags addresses repeatedly probing sensitive paths (admin panels, auth
/// endpoints, dotfiles, backups).
///
/// Counting is per request: a path matching several patterns is one attempt.
#[derive(Debug, Clone)]
pub struct SensitivePathDetector {
    patterns: Vec<String>,
    threshold: u64,
    high_threshold: u64,
}

impl Default for SensitivePathDetector {
    fn default() -> Self {
        Self::new(SensitivePathConfig::default())
    }
}

impl SensitivePathDetector {
    pub fn new(cfg: SensitivePathConfig) -> Self {
        Self {
            patterns: cfg.patterns.iter().map(|p| p.to_lowercase()).collect(),
            threshold: cfg.threshold,
            high_threshold: cfg.high_threshold,
        }
    }

    /// Case-insensitive substring match against any configured pattern.
    pub fn is_sensitive(&self, path: &str) -> bool {
        let path = path.to_lowercase();
        self.patterns.iter().any(|p| path.contains(p.as_str()))
    }
}

impl Detector for SensitivePathDetector {
    fn name(&self) -> &'static str {
        "sensitive_path"
    }

    fn scan(&self, events: &[RequestEvent]) -> Result<Vec<Finding>, DetectError> {
        let mut findings = Vec::new();

        for (address, evs) in group_by_address(events) {
            let attempts = evs.iter().filter(|ev| self.is_sensitive(&ev.path)).count() as u64;

            if attempts >= self.threshold {
                findings.push(Finding {
                    address: address.to_string(),
                    reason: format!("multiple sensitive path access: {} attempts", attempts),
                    severity: if attempts > self.high_threshold {
                        Severity::High
                    } else {
                        Severity::Medium
                    },
                    evidence_count: attempts,
                });
            }
        }

        Ok(findings)
    }
}
