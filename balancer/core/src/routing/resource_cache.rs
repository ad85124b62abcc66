//! Resource Check Cache
//!
//! Per `(server_url, model)` cache of resource verdicts so the monitor is not
//! asked on every request. The TTL adapts to how stable the pair has been:
//!
//! ```text
//!  stability  1    2    3    4    5    6 ...
//!  ttl        10s  20s  40s  80s  160s 300s (cap)
//!
//!  insufficient / unknown -> 5s, stability back to 0
//! ```
//!
//! Stability counts consecutive sufficient results for the pair and survives
//! expiry, so a pair that keeps answering "yes" keeps earning longer TTLs.

use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use super::config::ResourceCacheConfig;
use super::metrics::Counter;
use super::monitor::ResourceVerdict;

type PairKey = (String, String);

/// Cached verdict for one pair
#[derive(Clone, Copy, Debug)]
pub struct ResourceCacheEntry {
    /// Cached verdict
    pub verdict: ResourceVerdict,
    /// When the verdict was stored
    pub checked_at: Instant,
    /// How long it stays fresh
    pub ttl: Duration,
    /// Consecutive sufficient results
    pub stability_count: u32,
}

impl ResourceCacheEntry {
    /// Whether the entry is still within its TTL
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.checked_at.elapsed() < self.ttl
    }
}

/// Adaptive-TTL verdict cache
#[derive(Debug)]
pub struct ResourceCheckCache {
    config: ResourceCacheConfig,
    entries: DashMap<PairKey, ResourceCacheEntry>,
    hits: Counter,
    misses: Counter,
}

impl ResourceCheckCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(config: ResourceCacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            hits: Counter::new(),
            misses: Counter::new(),
        }
    }

    fn key(server_url: &str, model: &str) -> PairKey {
        (server_url.to_string(), model.to_string())
    }

    /// Fresh cached verdict, counting a hit or a miss
    pub fn get(&self, server_url: &str, model: &str) -> Option<ResourceVerdict> {
        let fresh = self
            .entries
            .get(&Self::key(server_url, model))
            .filter(|entry| entry.is_fresh())
            .map(|entry| entry.verdict);
        if fresh.is_some() {
            self.hits.inc();
        } else {
            self.misses.inc();
        }
        fresh
    }

    /// Store a verdict and return the resulting entry
    pub fn put(&self, server_url: &str, model: &str, verdict: ResourceVerdict) -> ResourceCacheEntry {
        let mut slot = self
            .entries
            .entry(Self::key(server_url, model))
            .or_insert(ResourceCacheEntry {
                verdict,
                checked_at: Instant::now(),
                ttl: Duration::ZERO,
                stability_count: 0,
            });

        let stability = if verdict.is_sufficient() {
            let previous = if slot.verdict.is_sufficient() {
                slot.stability_count
            } else {
                0
            };
            previous.saturating_add(1)
        } else {
            0
        };

        *slot = ResourceCacheEntry {
            verdict,
            checked_at: Instant::now(),
            ttl: self.config.ttl_for(verdict, stability),
            stability_count: stability,
        };
        *slot
    }

    /// Raw entry, fresh or not, without touching hit counters
    #[must_use]
    pub fn entry(&self, server_url: &str, model: &str) -> Option<ResourceCacheEntry> {
        self.entries
            .get(&Self::key(server_url, model))
            .map(|entry| *entry)
    }

    /// Drop every entry immediately, returning how many were dropped
    pub fn clear(&self) -> usize {
        let cleared = self.entries.len();
        self.entries.clear();
        tracing::info!(cleared, "Resource check cache cleared");
        cleared
    }

    /// Cache hits so far
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.get()
    }

    /// Cache misses so far
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.get()
    }

    /// Hit ratio in `0.0..=1.0`, 0 when nothing was looked up yet
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.get();
        let total = hits + self.misses.get();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Summary plus per-entry detail
    #[must_use]
    pub fn stats(&self) -> ResourceCacheStats {
        let mut entries: Vec<ResourceCacheEntryView> = self
            .entries
            .iter()
            .map(|item| {
                let (server_url, model) = item.key().clone();
                let entry = item.value();
                ResourceCacheEntryView {
                    server_url,
                    model,
                    verdict: entry.verdict,
                    fresh: entry.is_fresh(),
                    age_ms: u64::try_from(entry.checked_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                    ttl_ms: u64::try_from(entry.ttl.as_millis()).unwrap_or(u64::MAX),
                    stability_count: entry.stability_count,
                }
            })
            .collect();
        entries.sort_by(|a, b| (&a.server_url, &a.model).cmp(&(&b.server_url, &b.model)));

        ResourceCacheStats {
            total_entries: entries.len(),
            fresh_entries: entries.iter().filter(|e| e.fresh).count(),
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            entries,
        }
    }
}

/// Cache statistics for admin and metrics endpoints
#[derive(Clone, Debug, Default, Serialize)]
pub struct ResourceCacheStats {
    /// Entries held, fresh or stale
    pub total_entries: usize,
    /// Entries still within their TTL
    pub fresh_entries: usize,
    /// Lookups answered from cache
    pub hits: u64,
    /// Lookups that missed or found a stale entry
    pub misses: u64,
    /// `hits / (hits + misses)`
    pub hit_ratio: f64,
    /// Per-entry detail
    pub entries: Vec<ResourceCacheEntryView>,
}

/// One cache entry as reported by [`ResourceCheckCache::stats`]
#[derive(Clone, Debug, Serialize)]
pub struct ResourceCacheEntryView {
    /// Server base URL
    pub server_url: String,
    /// Actual model name
    pub model: String,
    /// Cached verdict
    pub verdict: ResourceVerdict,
    /// Still within TTL
    pub fresh: bool,
    /// Time since the verdict was stored
    pub age_ms: u64,
    /// TTL assigned to the verdict
    pub ttl_ms: u64,
    /// Consecutive sufficient results
    pub stability_count: u32,
}
