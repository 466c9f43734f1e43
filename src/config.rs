//! TOML configuration for ipwatch.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working setup. The config file path can come from the CLI,
//! the `IPWATCH_CONFIG` environment variable, or the system location.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CONFIG_ENV_VAR: &str = "IPWATCH_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/ipwatch/ipwatch.toml";

/// Longest window, suppression or retention period accepted (ten years).
pub const MAX_PERIOD_SECS: u64 = 10 * 365 * 86_400;

/// `value` units of `unit_secs` seconds, or `None` past [`MAX_PERIOD_SECS`].
pub fn checked_period(value: u64, unit_secs: u64) -> Option<TimeDelta> {
    value
        .checked_mul(unit_secs)
        .filter(|secs| *secs <= MAX_PERIOD_SECS)
        .and_then(|secs| TimeDelta::try_seconds(secs as i64))
}

fn period_or_max(value: u64, unit_secs: u64) -> TimeDelta {
    checked_period(value, unit_secs).unwrap_or(TimeDelta::seconds(MAX_PERIOD_SECS as i64))
}

fn require_period(field: &str, value: u64, unit_secs: u64, allow_zero: bool) -> Result<()> {
    if value == 0 && !allow_zero {
        bail!("{} must be greater than zero", field);
    }
    if checked_period(value, unit_secs).is_none() {
        bail!("{} = {} is out of range", field, value);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpWatchConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub denylist: DenylistConfig,
    #[serde(default)]
    pub geolocation: GeolocationConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub schedules: SchedulesConfig,
}

impl IpWatchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded ipwatch configuration");
        Ok(config)
    }

    /// Reject periods that are zero where that makes no sense, or too large
    /// to subtract from a timestamp.
    pub fn validate(&self) -> Result<()> {
        let d = &self.detection;
        require_period("detection.window_minutes", d.window_minutes, 60, false)?;
        require_period("detection.suppression_hours", d.suppression_hours, 3600, true)?;
        require_period("detection.burst.window_secs", d.burst.window_secs, 1, false)?;
        require_period("retention.days", self.retention.days, 86_400, false)?;
        Ok(())
    }

    /// Resolve configuration, in order:
    /// 1. An explicit path (from `--config`); a broken explicit file is an error.
    /// 2. The path in the `IPWATCH_CONFIG` environment variable.
    /// 3. `/etc/ipwatch/ipwatch.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "IPWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "data/ipwatch.db".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Anomaly detection window, suppression and per-detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Trailing window analysed per run.
    pub window_minutes: u64,
    /// Identical (address, reason) flags inside this interval are suppressed.
    pub suppression_hours: u64,
    /// Upper bound on the event store read.
    pub read_timeout_secs: u64,
    pub volume: VolumeConfig,
    pub sensitive_paths: SensitivePathConfig,
    pub burst: BurstConfig,
    pub geographic: GeographicConfig,
}

impl DetectionConfig {
    pub fn window(&self) -> TimeDelta {
        period_or_max(self.window_minutes, 60)
    }

    pub fn suppression(&self) -> TimeDelta {
        period_or_max(self.suppression_hours, 3600)
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            window_minutes: 60,
            suppression_hours: 6,
            read_timeout_secs: 30,
            volume: VolumeConfig::default(),
            sensitive_paths: SensitivePathConfig::default(),
            burst: BurstConfig::default(),
            geographic: GeographicConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Flag addresses with strictly more requests than this.
    pub threshold: u64,
    /// Above this the flag is `high` instead of `medium`.
    pub high_threshold: u64,
    /// Above this the flag is `critical` (auto-block). Off when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critical_threshold: Option<u64>,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            threshold: 100,
            high_threshold: 500,
            critical_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensitivePathConfig {
    /// Case-insensitive path substrings.
    pub patterns: Vec<String>,
    /// Flag addresses with at least this many sensitive requests.
    pub threshold: u64,
    pub high_threshold: u64,
}

impl Default for SensitivePathConfig {
    fn default() -> Self {
        Self {
            patterns: [
                "/admin",
                "/login",
                "/api/auth",
                "/wp-admin",
                "/.env",
                "/config",
                "/database",
                "/.git",
                "/backup",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            threshold: 5,
            high_threshold: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BurstConfig {
    /// Addresses with fewer events in the window are not scanned.
    pub min_events: usize,
    pub window_secs: u64,
    /// Flag when a window holds strictly more events than this.
    pub threshold: usize,
}

impl BurstConfig {
    pub fn window(&self) -> TimeDelta {
        period_or_max(self.window_secs, 1)
    }
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            min_events: 10,
            window_secs: 300,
            threshold: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeographicConfig {
    /// Country values that never count towards the spread.
    pub ignored_countries: Vec<String>,
    /// Flag when strictly more distinct countries than this are seen.
    pub max_countries: usize,
}

impl Default for GeographicConfig {
    fn default() -> Self {
        Self {
            ignored_countries: vec![String::new(), "Local".to_string()],
            max_countries: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Denylist / geolocation / retention
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DenylistConfig {
    pub cache_ttl_secs: u64,
    /// Upper bound on cached verdicts; 0 disables the cache.
    pub cache_capacity: u64,
}

impl Default for DenylistConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            cache_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeolocationConfig {
    pub enabled: bool,
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
    pub request_timeout_secs: u64,
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl_secs: 24 * 60 * 60,
            cache_capacity: 10_000,
            request_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Request logs older than this are purged by `cleanup-logs`.
    pub days: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { days: 30 }
    }
}

// ---------------------------------------------------------------------------
// Server / logging / schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit newline-delimited JSON instead of human-readable lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Cron expressions (6-field, with seconds) for the built-in jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulesConfig {
    pub detect_anomalies: String,
    pub cleanup_logs: String,
    pub security_report: String,
    /// How often the scheduler loop polls for due jobs.
    pub poll_interval_secs: u64,
}

impl Default for SchedulesConfig {
    fn default() -> Self {
        Self {
            detect_anomalies: "0 0 * * * *".to_string(),
            cleanup_logs: "0 30 3 * * *".to_string(),
            security_report: "0 0 6 * * *".to_string(),
            poll_interval_secs: 10,
        }
    }
}
