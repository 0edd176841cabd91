//! Diagnostic pass-through tier.
//!
//! [`TracingCache`] forwards every call to its inner store unchanged and
//! emits a `tracing` event per call, while counting hits, misses and writes
//! in [`CacheStats`]. It never alters stored state.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::tier::{CacheStore, CacheValue, EntityId};

// ── cache stats ──────────────────────────────────────────────────────

/// Counters tracking cache effectiveness.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads that found a value.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Reads that found nothing.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Mutating calls (set, remove, set_dirty, purge).
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Total lookups (hits + misses).
    pub fn lookups(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Hit rate as a value between 0.0 and 1.0 (returns 0.0 if no lookups).
    pub fn hit_rate(&self) -> f64 {
        let total = self.lookups();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} writes={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.writes(),
            self.hit_rate() * 100.0,
        )
    }
}

// ── tracing tier ─────────────────────────────────────────────────────

/// Logging decorator over any [`CacheStore`].
pub struct TracingCache {
    name: &'static str,
    inner: Arc<dyn CacheStore>,
    stats: CacheStats,
}

impl TracingCache {
    /// Wrap `inner`; `name` tags every event.
    pub fn new(name: &'static str, inner: Arc<dyn CacheStore>) -> Self {
        debug!(cache = name, "tracing cache attached");
        Self {
            name,
            inner,
            stats: CacheStats::default(),
        }
    }

    /// Counters collected so far.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<dyn CacheStore> {
        &self.inner
    }
}

impl CacheStore for TracingCache {
    fn set(&self, target: EntityId, key: &str, value: CacheValue, dirty: bool) {
        trace!(cache = self.name, target_id = %target, key, dirty, "cache set");
        self.stats.record_write();
        self.inner.set(target, key, value, dirty);
    }

    fn get(&self, target: EntityId, key: &str) -> Option<CacheValue> {
        let value = self.inner.get(target, key);
        if value.is_some() {
            self.stats.record_hit();
            trace!(cache = self.name, target_id = %target, key, "cache hit");
        } else {
            self.stats.record_miss();
            trace!(cache = self.name, target_id = %target, key, "cache miss");
        }
        value
    }

    fn remove(&self, target: EntityId, key: &str) {
        trace!(cache = self.name, target_id = %target, key, "cache remove");
        self.stats.record_write();
        self.inner.remove(target, key);
    }

    fn is_dirty(&self, target: EntityId, key: &str) -> bool {
        let dirty = self.inner.is_dirty(target, key);
        trace!(cache = self.name, target_id = %target, key, dirty, "cache is_dirty");
        dirty
    }

    fn set_dirty(&self, target: EntityId, key: &str, dirty: bool) {
        trace!(cache = self.name, target_id = %target, key, dirty, "cache set_dirty");
        self.stats.record_write();
        self.inner.set_dirty(target, key, dirty);
    }

    fn purge(&self, target: EntityId) {
        debug!(cache = self.name, target_id = %target, "cache purge");
        self.stats.record_write();
        self.inner.purge(target);
    }

    fn suspend(&self) {
        trace!(cache = self.name, "cache suspend");
        self.inner.suspend();
    }

    fn spill(&self) {
        trace!(cache = self.name, "cache spill");
        self.inner.spill();
    }
}

// ── tests ────────────────────────────────────────────────────────────
