//! Time-bounded result cache
//!
//! Maps a request fingerprint to a previously computed result with a
//! per-entry TTL and a bounded entry count. Expiry is lazy: an expired entry
//! is treated as a miss (and removed) on the `get` that observes it, and
//! capacity enforcement runs inline on the `put` that overflows. There is no
//! background sweeper thread.

mod fingerprint;

pub use fingerprint::fingerprint;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};

use crate::clock::SharedClock;

/// Request metadata attached to a cache entry, used for targeted invalidation
pub type EntryMeta = HashMap<String, String>;

/// A single cached result
struct CacheEntry<V> {
    value: V,
    created_at: DateTime<Utc>,
    ttl: Duration,
    meta: EntryMeta,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now > self.created_at + ttl,
            Err(_) => false,
        }
    }
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    hits: u64,
    misses: u64,
}

/// Snapshot of cache state for observability
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Entries past their TTL but not yet swept
    pub expired_pending: usize,
}

/// Result of a manual cleanup sweep
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CleanupReport {
    pub before: usize,
    pub after: usize,
}

/// Concurrency-safe TTL cache keyed by request fingerprint
///
/// A single mutex guards the whole table; entries are small and every
/// operation is O(entries) at worst, so lock hold times stay in the
/// microsecond range.
pub struct ResultCache<V> {
    inner: Mutex<CacheInner<V>>,
    clock: SharedClock,
    max_size: usize,
    default_ttl: Duration,
}

impl<V: Clone> ResultCache<V> {
    /// Create a cache with the given capacity and default TTL
    pub fn new(max_size: usize, default_ttl: Duration, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
            clock,
            max_size,
            default_ttl,
        }
    }

    /// Look up a fingerprint, treating expired entries as misses
    ///
    /// An expired-but-present entry is removed as a side effect.
    pub fn get(&self, fp: &str) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();

        let lookup = inner
            .entries
            .get(fp)
            .map(|e| (!e.is_expired(now)).then(|| e.value.clone()));

        match lookup {
            Some(Some(value)) => {
                inner.hits += 1;
                trace!(fingerprint = fp, "cache hit");
                Some(value)
            }
            Some(None) => {
                inner.entries.remove(fp);
                inner.misses += 1;
                trace!(fingerprint = fp, "cache miss (expired)");
                None
            }
            None => {
                inner.misses += 1;
                trace!(fingerprint = fp, "cache miss");
                None
            }
        }
    }

    /// Insert or replace an entry with the default TTL
    pub fn put(&self, fp: impl Into<String>, value: V) {
        self.put_with(fp, value, self.default_ttl, EntryMeta::new());
    }

    /// Insert or replace an entry with an explicit TTL
    pub fn put_with_ttl(&self, fp: impl Into<String>, value: V, ttl: Duration) {
        self.put_with(fp, value, ttl, EntryMeta::new());
    }

    /// Insert or replace an entry carrying request metadata for
    /// [`ResultCache::invalidate_matching`]
    pub fn put_with_metadata(&self, fp: impl Into<String>, value: V, meta: EntryMeta) {
        self.put_with(fp, value, self.default_ttl, meta);
    }

    /// Full insert: explicit TTL plus metadata
    pub fn put_with(&self, fp: impl Into<String>, value: V, ttl: Duration, meta: EntryMeta) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();

        inner.entries.insert(
            fp.into(),
            CacheEntry {
                value,
                created_at: now,
                ttl,
                meta,
            },
        );

        if inner.entries.len() > self.max_size {
            self.enforce_capacity(&mut inner, now);
        }
    }

    /// Two-phase overflow cleanup: expired entries first, then the oldest
    /// 20% by creation time (at least one, and at least enough to get back
    /// under capacity). Dead data goes before live-but-old data.
    fn enforce_capacity(&self, inner: &mut CacheInner<V>, now: DateTime<Utc>) {
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.is_expired(now));

        if inner.entries.len() > self.max_size {
            let len = inner.entries.len();
            let to_remove = (len / 5).max(1).max(len - self.max_size);

            let mut by_age: Vec<(String, DateTime<Utc>)> = inner
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.created_at))
                .collect();
            by_age.sort_by_key(|(_, created)| *created);

            for (key, _) in by_age.into_iter().take(to_remove) {
                inner.entries.remove(&key);
            }
        }

        debug!(
            before,
            after = inner.entries.len(),
            capacity = self.max_size,
            "cache capacity cleanup"
        );
    }

    /// Remove every entry unconditionally
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.entries.len();
        inner.entries.clear();
        debug!(removed, "cache invalidated");
    }

    /// Remove entries whose metadata satisfies the predicate
    ///
    /// Returns the number of entries removed.
    pub fn invalidate_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&EntryMeta) -> bool,
    {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !predicate(&e.meta));
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(removed, "cache entries invalidated by predicate");
        }
        removed
    }

    /// Manual expired-only sweep
    pub fn cleanup(&self) -> CleanupReport {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.is_expired(now));
        let after = inner.entries.len();
        if before != after {
            debug!(before, after, "cache expired-entry sweep");
        }
        CleanupReport { before, after }
    }

    /// Current cache statistics
    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let inner = self.inner.lock().unwrap();
        let total = inner.hits + inner.misses;
        let expired_pending = inner
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .count();

        CacheStats {
            size: inner.entries.len(),
            capacity: self.max_size,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total > 0 {
                inner.hits as f64 / total as f64
            } else {
                0.0
            },
            expired_pending,
        }
    }

    /// Current entry count
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A cached callable: checks the cache before invoking the wrapped operation
///
/// Pairs a key-derivation function with the operation it guards. On a miss
/// the operation runs and its result is stored under the derived key with the
/// cache's default TTL.
pub struct CachedFn<'a, A, V> {
    cache: &'a ResultCache<V>,
    key_fn: Box<dyn Fn(&A) -> String + Send + Sync + 'a>,
    op: Box<dyn Fn(&A) -> anyhow::Result<V> + Send + Sync + 'a>,
}

impl<'a, A, V: Clone> CachedFn<'a, A, V> {
    /// Wrap `op` so that results are cached under `key_fn(args)`
    pub fn new<K, F>(cache: &'a ResultCache<V>, key_fn: K, op: F) -> Self
    where
        K: Fn(&A) -> String + Send + Sync + 'a,
        F: Fn(&A) -> anyhow::Result<V> + Send + Sync + 'a,
    {
        Self {
            cache,
            key_fn: Box::new(key_fn),
            op: Box::new(op),
        }
    }

    /// Invoke the wrapped operation through the cache
    pub fn call(&self, args: &A) -> anyhow::Result<V> {
        let key = (self.key_fn)(args);
        if let Some(value) = self.cache.get(&key) {
            return Ok(value);
        }
        let value = (self.op)(args)?;
        self.cache.put(key, value.clone());
        Ok(value)
    }
}
