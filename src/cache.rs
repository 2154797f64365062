//! In-memory cache of translation results.
//!
//! Keys are content hashes built by the translator, so identical requests
//! map to the same entry. The cache never fails: anything it cannot serve
//! is a miss.

use lru::LruCache;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Default time-to-live of an entry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);
/// Default bound on the summed byte length of cached values.
pub const DEFAULT_MAX_COST: usize = 10_000_000;
/// Default bound on the number of entries.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

#[derive(Debug)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn cost(&self) -> usize {
        self.value.len()
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub cost: usize,
}

struct Inner {
    entries: LruCache<String, CacheEntry>,
    cost: usize,
    stats: CacheStats,
}

impl Inner {
    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.pop(key) {
            self.cost -= entry.cost();
        }
    }

    fn evict_lru(&mut self) -> bool {
        match self.entries.pop_lru() {
            Some((_, entry)) => {
                self.cost -= entry.cost();
                self.stats.evictions += 1;
                true
            }
            None => false,
        }
    }
}

/// Thread-safe LRU cache bounded by entry count and total cost.
pub struct TranslationCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    max_cost: usize,
    default_ttl: Duration,
}

impl TranslationCache {
    /// Creates a cache. Zero bounds are raised to one.
    pub fn new(max_entries: usize, max_cost: usize, default_ttl: Duration) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                cost: 0,
                stats: CacheStats::default(),
            }),
            max_entries,
            max_cost: max_cost.max(1),
            default_ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let (value, expired) = match inner.entries.get(key) {
            Some(entry) if entry.expires_at > now => (Some(entry.value.clone()), false),
            Some(_) => (None, true),
            None => (None, false),
        };

        if let Some(value) = value {
            inner.stats.hits += 1;
            tracing::debug!(key, "cache hit");
            return Some(value);
        }
        if expired {
            inner.remove(key);
        }
        inner.stats.misses += 1;
        tracing::debug!(key, expired, "cache miss");
        None
    }

    /// Stores `value` with the default TTL.
    pub fn set(&self, key: &str, value: &str) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Stores `value` until `ttl` elapses.
    ///
    /// Values larger than the whole cost budget are not stored.
    pub fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) {
        if value.len() > self.max_cost {
            tracing::debug!(key, size = value.len(), "value exceeds cache budget");
            return;
        }

        let mut inner = self.inner.lock();
        inner.remove(key);

        let entry = CacheEntry {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        };
        inner.cost += entry.cost();
        inner.entries.put(key.to_string(), entry);

        while inner.entries.len() > self.max_entries || inner.cost > self.max_cost {
            if !inner.evict_lru() {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.cost = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            cost: inner.cost,
            ..inner.stats
        }
    }
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_COST, DEFAULT_TTL)
    }
}
