//! IP geolocation used to enrich request logs.
//!
//! Private and loopback addresses resolve to `Local` without a lookup.
//! Public addresses go through a list of providers in order, the first
//! answer wins, and results (including empty ones) are cached in a bounded
//! TTL cache.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::GeolocationConfig;

const USER_AGENT: &str = concat!("ipwatch/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("request to {provider} failed: {source}")]
    Http {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} returned no location data")]
    NoData { provider: &'static str },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub country: String,
    pub city: String,
    pub region: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Location {
    pub fn local() -> Self {
        Self {
            country: "Local".to_string(),
            city: "Local".to_string(),
            region: "Local".to_string(),
            ..Self::default()
        }
    }
}

/// Default number of cached lookups.
pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

/// A remote geolocation service.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn lookup(&self, ip: IpAddr) -> Result<Location, GeoError>;
}

/// Private, loopback and link-local ranges never leave the host.
pub fn is_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link local
        }
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IpApiCoResponse {
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    country_name: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
}

impl IpApiCoResponse {
    fn into_location(self) -> Option<Location> {
        match self {
            IpApiCoResponse {
                error: None,
                country_name: Some(country),
                city,
                region,
                latitude,
                longitude,
            } if !country.is_empty() => Some(Location {
                country,
                city: city.unwrap_or_default(),
                region: region.unwrap_or_default(),
                latitude,
                longitude,
            }),
            _ => None,
        }
    }
}

/// ipapi.co (free tier: 1000 requests/day).
pub struct IpApiCo {
    client: reqwest::Client,
}

impl IpApiCo {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GeoProvider for IpApiCo {
    fn name(&self) -> &'static str {
        "ipapi.co"
    }

    async fn lookup(&self, ip: IpAddr) -> Result<Location, GeoError> {
        let http = |source: reqwest::Error| GeoError::Http {
            provider: self.name(),
            source,
        };
        let body: IpApiCoResponse = self
            .client
            .get(format!("http://ipapi.co/{}/json/", ip))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http)?
            .json()
            .await
            .map_err(http)?;

        body.into_location().ok_or(GeoError::NoData {
            provider: self.name(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiComResponse {
    status: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    region_name: String,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
}

impl IpApiComResponse {
    fn into_location(self) -> Option<Location> {
        if self.status != "success" {
            return None;
        }
        Some(Location {
            country: self.country,
            city: self.city,
            region: self.region_name,
            latitude: self.lat,
            longitude: self.lon,
        })
    }
}

/// ip-api.com (free tier: 45 requests/minute).
pub struct IpApiCom {
    client: reqwest::Client,
}

impl IpApiCom {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GeoProvider for IpApiCom {
    fn name(&self) -> &'static str {
        "ip-api.com"
    }

    async fn lookup(&self, ip: IpAddr) -> Result<Location, GeoError> {
        let http = |source: reqwest::Error| GeoError::Http {
            provider: self.name(),
            source,
        };
        let body: IpApiComResponse = self
            .client
            .get(format!("http://ip-api.com/json/{}", ip))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http)?
            .json()
            .await
            .map_err(http)?;

        body.into_location().ok_or(GeoError::NoData {
            provider: self.name(),
        })
    }
}

// ---------------------------------------------------------------------------
// Locator
// ---------------------------------------------------------------------------

/// Cached, multi-provider lookup.
pub struct GeoLocator {
    providers: Vec<Arc<dyn GeoProvider>>,
    cache: Option<Cache<IpAddr, Location>>,
}

impl GeoLocator {
    pub fn new(providers: Vec<Arc<dyn GeoProvider>>, ttl: Duration) -> Self {
        Self::with_capacity(providers, ttl, DEFAULT_CACHE_CAPACITY)
    }

    /// A zero `ttl` or `capacity` disables caching.
    pub fn with_capacity(
        providers: Vec<Arc<dyn GeoProvider>>,
        ttl: Duration,
        capacity: u64,
    ) -> Self {
        let cache = (!ttl.is_zero() && capacity > 0).then(|| {
            Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build()
        });
        Self { providers, cache }
    }

    /// ipapi.co first, ip-api.com as fallback; no providers when disabled.
    pub fn from_config(cfg: &GeolocationConfig) -> Result<Self> {
        let ttl = Duration::from_secs(cfg.cache_ttl_secs);
        if !cfg.enabled {
            return Ok(Self::with_capacity(Vec::new(), ttl, cfg.cache_capacity));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self::with_capacity(
            vec![
                Arc::new(IpApiCo::new(client.clone())),
                Arc::new(IpApiCom::new(client)),
            ],
            ttl,
            cfg.cache_capacity,
        ))
    }

    /// Never fails: unknown locations come back empty.
    pub async fn locate(&self, address: &str) -> Location {
        let ip = match address.parse::<IpAddr>() {
            Ok(ip) if !is_local(&ip) => ip,
            _ => return Location::local(),
        };

        let Some(cache) = &self.cache else {
            return self.fetch(ip).await;
        };
        if let Some(loc) = cache.get(&ip).await {
            return loc;
        }

        let location = self.fetch(ip).await;
        cache.insert(ip, location.clone()).await;
        location
    }

    async fn fetch(&self, ip: IpAddr) -> Location {
        if self.providers.is_empty() {
            return Location::default();
        }

        for provider in &self.providers {
            match provider.lookup(ip).await {
                Ok(loc) => return loc,
                Err(e) => {
                    warn!(%ip, provider = provider.name(), error = %e, "geolocation lookup failed")
                }
            }
        }

        warn!(%ip, "could not get geolocation data from any provider");
        Location::default()
    }
}
