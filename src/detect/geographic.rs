use std::collections::BTreeSet;

use crate::config::GeographicConfig;
use crate::detect::{group_by_address, DetectError, Detector, Finding, Severity};
use crate::events::RequestEvent;

/// Flags addresses whose requests geolocate to more than one country.
#[derive(Debug, Clone, Default)]
pub struct GeographicDetector {
    cfg: GeographicConfig,
}

impl GeographicDetector {
    pub fn new(cfg: GeographicConfig) -> Self {
        Self { cfg }
    }
}

impl Detector for GeographicDetector {
    fn name(&self) -> &'static str {
        "geographic"
    }

    fn scan(&self, events: &[RequestEvent]) -> Result<Vec<Finding>, DetectError> {
        let mut findings = Vec::new();

        for (address, evs) in group_by_address(events) {
            let countries: BTreeSet<&str> = evs
                .iter()
                .map(|ev| ev.country.as_str())
                .filter(|c| !self.cfg.ignored_countries.iter().any(|ignored| ignored == c))
                .collect();

            if countries.len() > self.cfg.max_countries {
                findings.push(Finding {
                    address: address.to_string(),
                    reason: format!(
                        "geographic anomaly: requests from {} different countries",
                        countries.len()
                    ),
                    severity: Severity::Low,
                    // Total requests, not the number of countries.
                    evidence_count: evs.len() as u64,
                });
            }
        }

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::fixtures::base_time;

    fn ev(addr: &str, country: &str) -> RequestEvent {
        RequestEvent::new(addr, base_time(), "/", country)
    }

    #[test]
    fn test_evidence_is_event_count() {
        let events = vec![ev("198.18.0.1", "US"), ev("198.18.0.1", "US"), ev("198.18.0.1", "FR")];
        let findings = GeographicDetector::default().scan(&events).unwrap();

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].evidence_count, 3);
        assert_eq!(findings[0].severity, Severity::Low);
        assert_eq!(
            findings[0].reason,
            "geographic anomaly: requests from 2 different countries"
        );
    }

    #[test]
    fn test_local_and_unknown_ignored() {
        let events = vec![ev("198.18.0.2", "DE"), ev("198.18.0.2", ""), ev("198.18.0.2", "Local")];
        assert!(GeographicDetector::default().scan(&events).unwrap().is_empty());
    }

    #[test]
    fn test_single_country_not_flagged() {
        let events = vec![ev("198.18.0.3", "JP"); 50];
        assert!(GeographicDetector::default().scan(&events).unwrap().is_empty());
    }
}
