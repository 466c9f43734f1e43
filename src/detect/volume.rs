use crate::config::VolumeConfig;
use crate::detect::{group_by_address, DetectError, Detector, Finding, Severity};
use crate::events::RequestEvent;

/// Flags addresses sending an excessive number of requests in the window.
#[derive(Debug, Clone, Default)]
pub struct VolumeDetector {
    cfg: VolumeConfig,
}

impl VolumeDetector {
    pub fn new(cfg: VolumeConfig) -> Self {
        Self { cfg }
    }

    fn severity_for(&self, count: u64) -> Severity {
        match self.cfg.critical_threshold {
            Some(critical) if count > critical => Severity::Critical,
            _ if count > self.cfg.high_threshold => Severity::High,
            _ => Severity::Medium,
        }
    }
}

impl Detector for VolumeDetector {
    fn name(&self) -> &'static str {
        "volume"
    }

    fn scan(&self, events: &[RequestEvent]) -> Result<Vec<Finding>, DetectError> {
        let findings = group_by_address(events)
            .into_iter()
            .filter_map(|(address, evs)| {
                let count = evs.len() as u64;
                (count > self.cfg.threshold).then(|| Finding {
                    address: address.to_string(),
                    reason: format!("excessive requests: {} requests/hour", count),
                    severity: self.severity_for(count),
                    evidence_count: count,
                })
            })
            .collect();
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::fixtures::series;

    #[test]
    fn test_threshold_boundaries() {
        let mut events = series("10.0.0.100", "/", 100, 1);
        events.extend(series("10.0.0.101", "/", 101, 1));
        events.extend(series("10.0.0.501", "/", 501, 1));

        let findings = VolumeDetector::default().scan(&events).unwrap();
        assert_eq!(findings.len(), 2);

        assert_eq!(findings[0].address, "10.0.0.101");
        assert_eq!(findings[0].severity, Severity::Medium);
        assert_eq!(findings[0].evidence_count, 101);
        assert_eq!(findings[0].reason, "excessive requests: 101 requests/hour");

        assert_eq!(findings[1].address, "10.0.0.501");
        assert_eq!(findings[1].severity, Severity::High);
    }

    #[test]
    fn test_exactly_high_threshold_is_medium() {
        let events = series("10.0.0.5", "/", 500, 1);
        let findings = VolumeDetector::default().scan(&events).unwrap();
        assert_eq!(findings[0].severity, Severity::Medium);
    }

    #[test]
    fn test_critical_threshold_when_configured() {
        let det = VolumeDetector::new(VolumeConfig {
            critical_threshold: Some(1000),
            ..VolumeConfig::default()
        });
        let events = series("10.0.0.9", "/", 1001, 1);
        let findings = det.scan(&events).unwrap();
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[test]
    fn test_empty_window() {
        assert!(VolumeDetector::default().scan(&[]).unwrap().is_empty());
    }
}
