use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::DetectionConfig;
use crate::denylist::Denylist;
use crate::detect::burst::BurstDetector;
use crate::detect::flagger::{FlagWriter, SuspicionLedger};
use crate::detect::geographic::GeographicDetector;
use crate::detect::sensitive_path::SensitivePathDetector;
use crate::detect::volume::VolumeDetector;
use crate::detect::{DetectError, Detector, Finding};
use crate::events::{EventStore, RequestEvent, SqliteEventStore};
use crate::storage::Pool;

/// Outcome of one detection run.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionSummary {
    pub events_analyzed: usize,
    pub flags_created: usize,
    pub timestamp: DateTime<Utc>,
    /// Detectors that failed during this run and contributed nothing.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_detectors: Vec<&'static str>,
}

/// Periodic batch analysis of recent request events.
pub struct AnomalyEngine {
    events: Arc<dyn EventStore>,
    detectors: Vec<Arc<dyn Detector>>,
    writer: FlagWriter,
    window: Duration,
    read_timeout: std::time::Duration,
}

impl AnomalyEngine {
    pub fn new(events: Arc<dyn EventStore>, writer: FlagWriter, cfg: &DetectionConfig) -> Self {
        Self {
            events,
            detectors: default_detectors(cfg),
            writer,
            window: cfg.window(),
            read_timeout: std::time::Duration::from_secs(cfg.read_timeout_secs),
        }
    }

    /// Engine wired to the SQLite event log and suspicion ledger.
    pub fn from_pool(pool: Pool, denylist: Denylist, cfg: &DetectionConfig) -> Self {
        let writer = FlagWriter::new(
            SuspicionLedger::new(pool.clone()),
            denylist,
            cfg.suppression(),
        );
        Self::new(Arc::new(SqliteEventStore::new(pool)), writer, cfg)
    }

    /// Replace the detector set. Findings are concatenated in this order.
    pub fn with_detectors(mut self, detectors: Vec<Arc<dyn Detector>>) -> Self {
        self.detectors = detectors;
        self
    }

    pub fn with_read_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub async fn run(&self) -> Result<DetectionSummary, DetectError> {
        self.run_at(Utc::now()).await
    }

    /// Analyse the window ending at `now`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<DetectionSummary, DetectError> {
        info!(window_minutes = self.window.num_minutes(), "Running anomaly detection");

        let events = self.fetch_window(now).await?;
        let (valid, skipped): (Vec<RequestEvent>, Vec<RequestEvent>) =
            events.into_iter().partition(RequestEvent::is_valid);
        for ev in &skipped {
            warn!(
                path = %ev.path,
                timestamp = %ev.timestamp,
                "skipping event without source address"
            );
        }

        let window: Arc<[RequestEvent]> = valid.into();
        let (findings, failed_detectors) = self.scan(Arc::clone(&window)).await;

        let writer = self.writer.clone();
        let flags_created = tokio::task::spawn_blocking(move || writer.write(&findings, now))
            .await
            .map_err(|e| anyhow::anyhow!("flag writer task failed: {}", e))??;

        let summary = DetectionSummary {
            events_analyzed: window.len(),
            flags_created,
            timestamp: now,
            failed_detectors,
        };
        info!(
            events = summary.events_analyzed,
            flags = summary.flags_created,
            failed = summary.failed_detectors.len(),
            "Anomaly detection completed"
        );
        Ok(summary)
    }

    async fn fetch_window(&self, now: DateTime<Utc>) -> Result<Vec<RequestEvent>, DetectError> {
        let store = Arc::clone(&self.events);
        let start = now - self.window;
        let read = tokio::task::spawn_blocking(move || store.events_in_window(start, now));

        let result = match tokio::time::timeout(self.read_timeout, read).await {
            Ok(Ok(Ok(events))) => Ok(events),
            Ok(Ok(Err(e))) => Err(DetectError::TransientData(format!("{:#}", e))),
            Ok(Err(join)) => Err(DetectError::TransientData(join.to_string())),
            Err(_) => Err(DetectError::TransientData(format!(
                "read timed out after {:?}",
                self.read_timeout
            ))),
        };
        if let Err(e) = &result {
            error!(error = %e, "aborting detection run");
        }
        result
    }

    /// Run every detector over the shared snapshot. A detector that errors or
    /// panics is logged and skipped.
    async fn scan(&self, window: Arc<[RequestEvent]>) -> (Vec<Finding>, Vec<&'static str>) {
        let handles = self.detectors.iter().map(|det| {
            let det = Arc::clone(det);
            let window = Arc::clone(&window);
            tokio::task::spawn_blocking(move || det.scan(&window))
        });
        let results = futures::future::join_all(handles).await;

        let mut findings = Vec::new();
        let mut failed = Vec::new();
        for (det, result) in self.detectors.iter().zip(results) {
            let outcome = match result {
                Ok(inner) => inner,
                Err(join) => Err(DetectError::DetectorFailure {
                    detector: det.name(),
                    message: join.to_string(),
                }),
            };
            match outcome {
                Ok(mut found) => {
                    debug!(detector = det.name(), findings = found.len(), "detector finished");
                    findings.append(&mut found);
                }
                Err(e) => {
                    error!(
                        detector = det.name(),
                        error = %e,
                        "detector failed, continuing without it"
                    );
                    failed.push(det.name());
                }
            }
        }
        (findings, failed)
    }
}

fn default_detectors(cfg: &DetectionConfig) -> Vec<Arc<dyn Detector>> {
    vec![
        Arc::new(VolumeDetector::new(cfg.volume.clone())),
        Arc::new(SensitivePathDetector::new(cfg.sensitive_paths.clone())),
        Arc::new(BurstDetector::new(cfg.burst.clone())),
        Arc::new(GeographicDetector::new(cfg.geographic.clone())),
    ]
}
