//! Denylist of blocked addresses.
//!
//! Reads go through a bounded, short-lived in-process cache, because the
//! request middleware consults it on every inbound request. Every write
//! through this type evicts the cached verdict for the address it touches.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use moka::sync::Cache;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{from_db_time, to_db_time, Pool};

/// Largest network a single block/unblock command may expand.
pub const MAX_EXPANDED_HOSTS: usize = 1000;

/// Default number of cached verdicts.
pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

#[derive(Debug, Error)]
pub enum DenylistError {
    #[error("invalid IP address or network: {0}")]
    InvalidTarget(String),

    #[error("network {network} is too large (>{limit} hosts), use smaller subnets")]
    NetworkTooLarge { network: String, limit: usize },
}

/// A persisted block entry. At most one row exists per address.
#[derive(Debug, Clone, Serialize)]
pub struct BlockRecord {
    pub id: i64,
    pub address: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

/// Result of a get-or-reactivate block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Created,
    Reactivated,
    AlreadyActive,
}

impl BlockOutcome {
    /// True when this call turned the address from allowed into blocked.
    pub fn is_new(&self) -> bool {
        !matches!(self, BlockOutcome::AlreadyActive)
    }
}

#[derive(Clone)]
pub struct Denylist {
    pool: Pool,
    cache: Option<Cache<String, bool>>,
    // Bumped on every local write. A lookup that started before a write
    // must not leave its answer in the cache.
    generation: Arc<AtomicU64>,
}

impl Denylist {
    pub fn new(pool: Pool, ttl: Duration) -> Self {
        Self::with_capacity(pool, ttl, DEFAULT_CACHE_CAPACITY)
    }

    /// A zero `ttl` or `capacity` disables caching.
    pub fn with_capacity(pool: Pool, ttl: Duration, capacity: u64) -> Self {
        let cache = (!ttl.is_zero() && capacity > 0).then(|| {
            Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build()
        });
        Self {
            pool,
            cache,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether `address` has an active block. Answers may be up to `ttl` old
    /// for writes made by other processes.
    pub fn is_blocked(&self, address: &str) -> Result<bool> {
        let Some(cache) = &self.cache else {
            return self.query_blocked(address);
        };
        if let Some(blocked) = cache.get(address) {
            return Ok(blocked);
        }

        let seen = self.generation.load(Ordering::Acquire);
        let blocked = self.query_blocked(address)?;
        self.remember(cache, address, blocked, seen);
        Ok(blocked)
    }

    fn query_blocked(&self, address: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM blocked_ips WHERE address = ?1 AND active = 1)",
            params![address],
            |row| row.get(0),
        )
        .context("Failed to query denylist")
    }

    fn remember(&self, cache: &Cache<String, bool>, address: &str, blocked: bool, seen: u64) {
        cache.insert(address.to_string(), blocked);
        if self.generation.load(Ordering::Acquire) != seen {
            cache.invalidate(address);
        }
    }

    fn evict(&self, address: &str) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(cache) = &self.cache {
            cache.invalidate(address);
        }
    }

    /// Atomically block `address`: create the record, reactivate an inactive
    /// one (taking the new reason), or leave an active one untouched.
    pub fn ensure_blocked(&self, address: &str, reason: &str) -> Result<BlockOutcome> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<bool> = tx
            .query_row(
                "SELECT active FROM blocked_ips WHERE address = ?1",
                params![address],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO blocked_ips (address, reason, created_at, active)
                     VALUES (?1, ?2, ?3, 1)",
                    params![address, reason, to_db_time(Utc::now())],
                )?;
                BlockOutcome::Created
            }
            Some(false) => {
                tx.execute(
                    "UPDATE blocked_ips SET active = 1, reason = ?2 WHERE address = ?1",
                    params![address, reason],
                )?;
                BlockOutcome::Reactivated
            }
            Some(true) => BlockOutcome::AlreadyActive,
        };

        tx.commit().context("Failed to commit block")?;

        if outcome.is_new() {
            self.evict(address);
            info!(%address, %reason, ?outcome, "address blocked");
        } else {
            debug!(%address, "address already blocked");
        }
        Ok(outcome)
    }

    /// Deactivate the block on `address`. Returns false if it was not blocked.
    pub fn unblock(&self, address: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE blocked_ips SET active = 0 WHERE address = ?1 AND active = 1",
            params![address],
        )?;
        self.evict(address);
        if changed > 0 {
            info!(%address, "address unblocked");
        }
        Ok(changed > 0)
    }

    /// Active blocks, newest first.
    pub fn list_active(&self) -> Result<Vec<BlockRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, address, reason, created_at, active FROM blocked_ips
             WHERE active = 1 ORDER BY created_at DESC, id DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for r in rows {
            let (id, address, reason, created_at, active) = r?;
            records.push(BlockRecord {
                id,
                address,
                reason,
                created_at: from_db_time(&created_at)?,
                active,
            });
        }
        Ok(records)
    }

    pub fn active_count(&self) -> Result<u64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM blocked_ips WHERE active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

/// Expand a CLI target (single address or CIDR network) into host addresses.
pub fn expand_target(input: &str) -> Result<Vec<IpAddr>, DenylistError> {
    let input = input.trim();
    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    let net: IpNet = input
        .parse()
        .map_err(|_| DenylistError::InvalidTarget(input.to_string()))?;
    let net = net.trunc();

    let hosts: Vec<IpAddr> = net.hosts().take(MAX_EXPANDED_HOSTS + 1).collect();
    if hosts.len() > MAX_EXPANDED_HOSTS {
        return Err(DenylistError::NetworkTooLarge {
            network: net.to_string(),
            limit: MAX_EXPANDED_HOSTS,
        });
    }
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::temp_pool;

    fn denylist() -> (tempfile::TempDir, Denylist) {
        let (dir, pool) = temp_pool();
        (dir, Denylist::new(pool, Duration::from_secs(300)))
    }

    #[test]
    fn test_get_or_reactivate_lifecycle() {
        let (_dir, list) = denylist();

        assert_eq!(list.ensure_blocked("192.0.2.1", "first").unwrap(), BlockOutcome::Created);
        assert_eq!(
            list.ensure_blocked("192.0.2.1", "second").unwrap(),
            BlockOutcome::AlreadyActive
        );
        assert!(list.unblock("192.0.2.1").unwrap());
        assert!(!list.unblock("192.0.2.1").unwrap());
        assert_eq!(
            list.ensure_blocked("192.0.2.1", "third").unwrap(),
            BlockOutcome::Reactivated
        );

        let active = list.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].reason, "third");
    }

    #[test]
    fn test_write_evicts_cached_verdict() {
        let (_dir, list) = denylist();

        assert!(!list.is_blocked("192.0.2.2").unwrap());
        list.ensure_blocked("192.0.2.2", "manual").unwrap();
        assert!(list.is_blocked("192.0.2.2").unwrap());
        list.unblock("192.0.2.2").unwrap();
        assert!(!list.is_blocked("192.0.2.2").unwrap());
    }

    #[test]
    fn test_other_writer_visible_after_ttl() {
        let (_dir, pool) = temp_pool();
        let reader = Denylist::new(pool.clone(), Duration::from_secs(300));
        let writer = Denylist::new(pool.clone(), Duration::from_secs(300));

        assert!(!reader.is_blocked("192.0.2.3").unwrap());
        writer.ensure_blocked("192.0.2.3", "elsewhere").unwrap();
        // Cached negative answer survives until the TTL lapses.
        assert!(!reader.is_blocked("192.0.2.3").unwrap());

        let fresh = Denylist::new(pool, Duration::ZERO);
        assert!(fresh.is_blocked("192.0.2.3").unwrap());
    }

    #[test]
    fn test_concurrent_blocks_create_one_record() {
        let (_dir, list) = denylist();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let list = list.clone();
                std::thread::spawn(move || list.ensure_blocked("192.0.2.4", "race").unwrap())
            })
            .collect();
        let outcomes: Vec<BlockOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(outcomes.iter().filter(|o| o.is_new()).count(), 1);
        assert_eq!(list.active_count().unwrap(), 1);
    }

    #[test]
    fn test_expand_single_and_network() {
        assert_eq!(expand_target("10.1.2.3").unwrap().len(), 1);
        assert_eq!(expand_target("2001:db8::1").unwrap().len(), 1);

        let hosts = expand_target("192.168.10.0/30").unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].to_string(), "192.168.10.1");

        // Host bits are ignored, like a non-strict network parse.
        assert_eq!(expand_target("192.168.10.7/30").unwrap().len(), 2);
    }

    #[test]
    fn test_expand_rejects_bad_input() {
        assert!(matches!(
            expand_target("10.0.0.0/16"),
            Err(DenylistError::NetworkTooLarge { .. })
        ));
        assert!(matches!(
            expand_target("not-an-ip"),
            Err(DenylistError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_lookup_overtaken_by_write_is_not_cached() {
        let (_dir, list) = denylist();
        let cache = list.cache.clone().unwrap();

        // A lookup read "not blocked", then a block landed before it cached.
        let seen = list.generation.load(Ordering::Acquire);
        list.ensure_blocked("192.0.2.5", "manual").unwrap();
        list.remember(&cache, "192.0.2.5", false, seen);

        assert!(cache.get("192.0.2.5").is_none());
        assert!(list.is_blocked("192.0.2.5").unwrap());
        assert_eq!(cache.get("192.0.2.5"), Some(true));
    }

    #[test]
    fn test_cache_is_bounded() {
        let (_dir, pool) = temp_pool();
        let list = Denylist::with_capacity(pool, Duration::from_secs(300), 16);
        for i in 0..200u32 {
            let address = IpAddr::from(std::net::Ipv4Addr::from(0xC633_6400 + i)).to_string();
            assert!(!list.is_blocked(&address).unwrap());
        }

        let cache = list.cache.as_ref().unwrap();
        cache.run_pending_tasks();
        assert!(cache.entry_count() <= 16);
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let (_dir, pool) = temp_pool();
        assert!(Denylist::new(pool.clone(), Duration::ZERO).cache.is_none());
        assert!(Denylist::with_capacity(pool, Duration::from_secs(1), 0).cache.is_none());
    }
}
