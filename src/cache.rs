//! In-memory TTL cache of registry results, keyed by canonical plate.
//!
//! Backed by `DashMap`, so lookups for different plates land on different
//! shards and never wait on each other. Expired entries are treated as absent
//! and evicted lazily on read, or in bulk by [`VehicleCache::purge_expired`].

use crate::clock::{duration_millis, Clock, SystemClock};
use crate::dynamic_config::DynamicConfig;
use crate::plate::Plate;
use crate::vehicle::VehicleRecord;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default time-to-live for cached registry results.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cache settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Entries older than this are stale.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_CACHE_TTL }
    }
}

/// A cached record and when it was fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub record: VehicleRecord,
    /// Epoch millis at insertion.
    pub fetched_at: u64,
}

impl CacheEntry {
    /// Milliseconds since the entry was stored.
    pub fn age_millis(&self, now_millis: u64) -> u64 {
        now_millis.saturating_sub(self.fetched_at)
    }

    fn is_expired(&self, now_millis: u64, ttl_millis: u64) -> bool {
        self.age_millis(now_millis) > ttl_millis
    }
}

/// Counters reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Stored entries, including expired ones not yet evicted.
    pub size: usize,
    pub ttl_secs: u64,
}

/// Plate → vehicle cache with TTL expiry.
#[derive(Debug)]
pub struct VehicleCache {
    entries: DashMap<Plate, CacheEntry>,
    ttl: DynamicConfig<Duration>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for VehicleCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl VehicleCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build a cache reading time from `clock`.
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: DynamicConfig::new(config.ttl),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fresh entry for `plate`, or `None` when absent or expired.
    pub fn get(&self, plate: &Plate) -> Option<CacheEntry> {
        let now = self.clock.now_millis();
        let ttl = self.ttl_millis();

        // The shard guard must be released before a conditional remove on the same key.
        let found = self.entries.get(plate).map(|entry| entry.value().clone());

        match found {
            Some(entry) if !entry.is_expired(now, ttl) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Some(_) => {
                self.evict_if_expired(plate, now, ttl);
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(plate = %plate, "cache entry expired");
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `record` under `plate`. Last write wins.
    pub fn put(&self, plate: Plate, record: VehicleRecord) {
        let fetched_at = self.clock.now_millis();
        self.entries.insert(plate, CacheEntry { record, fetched_at });
    }

    /// Drop the entry for `plate`. Returns whether one existed.
    pub fn invalidate(&self, plate: &Plate) -> bool {
        self.entries.remove(plate).is_some()
    }

    /// Drop everything. Returns how many entries were removed. Counters are kept.
    pub fn clear(&self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    /// Evict every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let ttl = self.ttl_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now, ttl));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        *self.ttl.get()
    }

    /// Change the TTL; applies to existing entries on their next read.
    pub fn set_ttl(&self, ttl: Duration) {
        self.ttl.set(ttl);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.len(),
            ttl_secs: self.ttl().as_secs(),
        }
    }

    // Re-checks under the shard write lock, so a fresh `put` that landed after
    // the caller saw the stale entry survives.
    fn evict_if_expired(&self, plate: &Plate, now: u64, ttl_millis: u64) -> bool {
        self.entries.remove_if(plate, |_, entry| entry.is_expired(now, ttl_millis)).is_some()
    }

    fn ttl_millis(&self) -> u64 {
        duration_millis(*self.ttl.get())
    }
}
