//! Security-scoped result cache.
//!
//! Successful results of cacheable operations are memoized under a key
//! derived from the operation fingerprint and the caller's security scope,
//! so actors with different authorization never share entries. Every read
//! re-validates the stored value; an entry that fails is evicted and the
//! read reports a miss.

mod key;

pub use key::{canonical_json, checksum, CacheKey, Fingerprint};

use std::cell::RefCell;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::operation::OperationDescriptor;
use crate::validation::{RuleSet, ValidationService};

/// How a result is stored.
#[derive(Debug, Clone, Default)]
pub struct CachePolicy {
    /// Time-to-live.
    pub ttl: Duration,
    /// Rules the value must still satisfy when read.
    pub rules: RuleSet,
    /// Invalidation tags.
    pub tags: BTreeSet<String>,
}

/// A cached result with its integrity metadata.
#[derive(Debug)]
struct CachedResult {
    value: Value,
    checksum: String,
    rules: RuleSet,
    fingerprint_digest: String,
    tags: BTreeSet<String>,
    expires_at: u64,
    hits: AtomicU64,
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    integrity_failures: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheStats {
    /// Get hit count.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries written.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Entries evicted for capacity.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Entries dropped after their TTL.
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Entries evicted because they failed re-validation.
    pub fn integrity_failures(&self) -> u64 {
        self.integrity_failures.load(Ordering::Relaxed)
    }

    /// Entries removed by explicit invalidation.
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Calculate hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}

thread_local! {
    /// Populate locks held by this thread, as (cache address, key).
    static POPULATING: RefCell<HashSet<(usize, CacheKey)>> = RefCell::new(HashSet::new());
}

/// Releases a populate lock: unmarks it for the thread and drops the map
/// entry once nobody else waits on it. Runs on unwind too.
struct PopulateRelease<'c> {
    cache: &'c ResultCache,
    key: CacheKey,
}

impl Drop for PopulateRelease<'_> {
    fn drop(&mut self) {
        POPULATING.with(|held| {
            held.borrow_mut().remove(&(self.cache.address(), self.key.clone()));
        });
        self.cache
            .populate_locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Result cache with TTL, capacity bound and tag invalidation.
pub struct ResultCache {
    config: CacheConfig,
    entries: DashMap<CacheKey, CachedResult>,
    /// Fingerprint digest -> keys in every scope.
    by_fingerprint: DashMap<String, HashSet<CacheKey>>,
    /// Tag -> keys.
    by_tag: DashMap<String, HashSet<CacheKey>>,
    populate_locks: DashMap<CacheKey, Arc<Mutex<()>>>,
    validation: Arc<ValidationService>,
    clock: SharedClock,
    stats: CacheStats,
}

impl ResultCache {
    /// Create a cache that re-validates reads with `validation`.
    pub fn new(
        config: CacheConfig,
        validation: Arc<ValidationService>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            by_fingerprint: DashMap::new(),
            by_tag: DashMap::new(),
            populate_locks: DashMap::new(),
            validation,
            clock,
            stats: CacheStats::default(),
        }
    }

    /// Whether the cache is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Get cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Policy for a descriptor: the kind's TTL, its result rules and tags.
    pub fn policy_for(&self, operation: &OperationDescriptor) -> CachePolicy {
        CachePolicy {
            ttl: self.config.ttl_for(operation.kind()),
            rules: operation.result_rules().clone(),
            tags: operation.tags().clone(),
        }
    }

    /// Look up a result.
    ///
    /// Expired entries and entries failing the checksum or rule check are
    /// evicted and reported as a miss.
    pub fn get(&self, fingerprint: &Fingerprint, scope: &str) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }
        let key = fingerprint.key(scope);
        let now = self.clock.now_micros();

        let verdict = match self.entries.get(&key) {
            None => Lookup::Absent,
            Some(entry) if entry.expires_at <= now => Lookup::Expired,
            Some(entry) => {
                if checksum(&entry.value) != entry.checksum {
                    Lookup::Corrupt("checksum mismatch".to_string())
                } else if let Err(violations) =
                    self.validation.validate_result(&entry.value, &entry.rules)
                {
                    Lookup::Corrupt(format!("{} rule violation(s)", violations.len()))
                } else {
                    entry.hits.fetch_add(1, Ordering::Relaxed);
                    Lookup::Hit(entry.value.clone())
                }
            }
        };

        match verdict {
            Lookup::Hit(value) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, kind = fingerprint.kind(), "cache hit");
                return Some(value);
            }
            Lookup::Absent => {}
            Lookup::Expired => {
                self.remove(&key);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            }
            Lookup::Corrupt(reason) => {
                self.remove(&key);
                self.stats.integrity_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %key,
                    kind = fingerprint.kind(),
                    reason = %reason,
                    "cached result failed re-validation; evicted"
                );
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a result. Evicts the least-hit entry when at capacity.
    pub fn put(
        &self,
        fingerprint: &Fingerprint,
        scope: &str,
        value: Value,
        policy: CachePolicy,
    ) -> Option<CacheKey> {
        if !self.config.enabled || policy.ttl.is_zero() {
            return None;
        }
        let key = fingerprint.key(scope);
        if !self.entries.contains_key(&key) && self.entries.len() >= self.config.capacity {
            self.make_room();
        }

        let fingerprint_digest = fingerprint.digest();
        let entry = CachedResult {
            checksum: checksum(&value),
            value,
            rules: policy.rules,
            fingerprint_digest: fingerprint_digest.clone(),
            tags: policy.tags,
            expires_at: self
                .clock
                .now_micros()
                .saturating_add(policy.ttl.as_micros() as u64),
            hits: AtomicU64::new(0),
        };

        let tags = entry.tags.clone();
        if let Some(previous) = self.entries.insert(key.clone(), entry) {
            let stale: BTreeSet<String> = previous.tags.difference(&tags).cloned().collect();
            self.unindex_tags(&key, &stale);
        }
        for tag in tags {
            self.by_tag.entry(tag).or_default().insert(key.clone());
        }
        self.by_fingerprint
            .entry(fingerprint_digest)
            .or_default()
            .insert(key.clone());
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, kind = fingerprint.kind(), "cache write");
        Some(key)
    }

    /// Remove every scoped entry of a fingerprint.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> usize {
        let keys = self
            .by_fingerprint
            .remove(&fingerprint.digest())
            .map(|(_, keys)| keys)
            .unwrap_or_default();
        self.invalidate_keys(keys)
    }

    /// Remove every entry carrying any of the tags.
    pub fn invalidate_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let mut keys = HashSet::new();
        for tag in tags {
            if let Some((_, tagged)) = self.by_tag.remove(tag.as_ref()) {
                keys.extend(tagged);
            }
        }
        self.invalidate_keys(keys)
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.entries.clear();
        self.by_fingerprint.clear();
        self.by_tag.clear();
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_micros();
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.stats
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Run `f` holding the populate lock of `key`.
    ///
    /// At most one caller populates a key at a time; others wait here and
    /// should re-check the cache once they hold the lock. A thread that
    /// already holds the lock of `key` runs `f` directly.
    pub fn with_populate_lock<T>(&self, key: &CacheKey, f: impl FnOnce() -> T) -> T {
        let marker = (self.address(), key.clone());
        if POPULATING.with(|held| held.borrow().contains(&marker)) {
            debug!(key = %key, "re-entrant populate");
            return f();
        }

        // Declared first so it drops last, after the lock handle below.
        let _release = PopulateRelease {
            cache: self,
            key: key.clone(),
        };
        let lock = self
            .populate_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _populating = lock.lock();
        POPULATING.with(|held| held.borrow_mut().insert(marker));
        f()
    }

    fn address(&self) -> usize {
        self as *const Self as usize
    }

    /// Number of keys with a live populate lock.
    pub fn populating(&self) -> usize {
        self.populate_locks.len()
    }

    fn invalidate_keys(&self, keys: HashSet<CacheKey>) -> usize {
        let mut removed = 0;
        for key in keys {
            if self.remove(&key) {
                removed += 1;
            }
        }
        self.stats
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    fn make_room(&self) {
        if self.purge_expired() > 0 && self.entries.len() < self.config.capacity {
            return;
        }
        let victim = self
            .entries
            .iter()
            .min_by_key(|e| e.hits.load(Ordering::Relaxed))
            .map(|e| e.key().clone());
        if let Some(key) = victim {
            self.remove(&key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "cache eviction");
        }
    }

    fn remove(&self, key: &CacheKey) -> bool {
        let Some((_, entry)) = self.entries.remove(key) else {
            return false;
        };
        self.unindex_tags(key, &entry.tags);
        if let Some(mut keys) = self.by_fingerprint.get_mut(&entry.fingerprint_digest) {
            keys.remove(key);
        }
        self.by_fingerprint
            .remove_if(&entry.fingerprint_digest, |_, keys| keys.is_empty());
        true
    }

    fn unindex_tags(&self, key: &CacheKey, tags: &BTreeSet<String>) {
        for tag in tags {
            if let Some(mut keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
            }
            self.by_tag.remove_if(tag, |_, keys| keys.is_empty());
        }
    }
}

enum Lookup {
    Absent,
    Expired,
    Corrupt(String),
    Hit(Value),
}
