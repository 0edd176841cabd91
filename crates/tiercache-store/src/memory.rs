//! Flat in-memory tier.
//!
//! [`MemoryCache`] is the baseline [`CacheStore`]: a concurrent map keyed by
//! `(target, key)` with no persistence. Backed by [`DashMap`] so readers on
//! different shards never contend.

use dashmap::DashMap;
use tracing::trace;

use crate::tier::{CacheRecord, CacheStore, CacheValue, EntityId};

/// Unbounded in-process cache keyed by `(target, key)`.
#[derive(Debug, Default)]
pub struct MemoryCache {
    records: DashMap<(EntityId, String), CacheRecord>,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the full record for `(target, key)`.
    pub fn record(&self, target: EntityId, key: &str) -> Option<CacheRecord> {
        self.records
            .get(&(target, key.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Whether a record exists for `(target, key)`.
    pub fn contains(&self, target: EntityId, key: &str) -> bool {
        self.records.contains_key(&(target, key.to_string()))
    }

    /// Number of records across all targets.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the cache holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Keys currently stored for `target`, sorted.
    pub fn keys(&self, target: EntityId) -> Vec<String> {
        let mut keys: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == target)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl CacheStore for MemoryCache {
    fn set(&self, target: EntityId, key: &str, value: CacheValue, dirty: bool) {
        trace!(target_id = %target, key, dirty, "memory_cache.set");
        self.records
            .insert((target, key.to_string()), CacheRecord { value, dirty });
    }

    fn get(&self, target: EntityId, key: &str) -> Option<CacheValue> {
        self.records
            .get(&(target, key.to_string()))
            .map(|entry| entry.value().value.clone())
    }

    fn remove(&self, target: EntityId, key: &str) {
        trace!(target_id = %target, key, "memory_cache.remove");
        self.records.remove(&(target, key.to_string()));
    }

    fn is_dirty(&self, target: EntityId, key: &str) -> bool {
        self.records
            .get(&(target, key.to_string()))
            .map(|entry| entry.value().dirty)
            .unwrap_or(true)
    }

    fn set_dirty(&self, target: EntityId, key: &str, dirty: bool) {
        if let Some(mut entry) = self.records.get_mut(&(target, key.to_string())) {
            entry.dirty = dirty;
        }
    }

    fn purge(&self, target: EntityId) {
        let before = self.records.len();
        self.records.retain(|(id, _), _| *id != target);
        trace!(
            target_id = %target,
            removed = before.saturating_sub(self.records.len()),
            "memory_cache.purge"
        );
    }
}

// ── tests ────────────────────────────────────────────────────────────
