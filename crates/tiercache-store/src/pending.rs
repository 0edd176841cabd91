//! Pre-attachment buffering tier.
//!
//! Entities are often created before the durable cache for their project is
//! open. [`PendingCache`] accepts writes in the meantime, answers reads from
//! what it has buffered, and on [`PendingCache::attach`] replays the buffer
//! against the real backend in submission order. From then on every call is
//! routed straight to the backend.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::memory::MemoryCache;
use crate::tier::{CacheOp, CacheStore, CacheValue, EntityId};

enum PendingState {
    Buffering {
        log: Vec<CacheOp>,
        view: MemoryCache,
    },
    Attached(Arc<dyn CacheStore>),
}

/// A [`CacheStore`] that buffers until a backend is attached.
pub struct PendingCache {
    state: Mutex<PendingState>,
}

impl Default for PendingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCache {
    /// Create a tier with no backend.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PendingState::Buffering {
                log: Vec::new(),
                view: MemoryCache::new(),
            }),
        }
    }

    /// Create a tier that is already attached to `backend`.
    pub fn attached(backend: Arc<dyn CacheStore>) -> Self {
        Self {
            state: Mutex::new(PendingState::Attached(backend)),
        }
    }

    /// Attach `backend`, replaying every buffered operation in order.
    ///
    /// Returns `false` (and leaves the current backend in place) if a
    /// backend was already attached.
    pub fn attach(&self, backend: Arc<dyn CacheStore>) -> bool {
        let mut state = self.lock();
        let log = match &mut *state {
            PendingState::Attached(_) => {
                warn!("pending cache already attached, ignoring second backend");
                return false;
            }
            PendingState::Buffering { log, .. } => std::mem::take(log),
        };

        // Replay happens under the state lock so no direct call can overtake
        // a buffered one. The backend never calls back into this tier.
        let replayed = log.len();
        for op in log {
            op.apply(backend.as_ref());
        }
        *state = PendingState::Attached(backend);

        info!(replayed, "pending cache attached");
        true
    }

    /// Whether a backend has been attached.
    pub fn is_attached(&self) -> bool {
        matches!(*self.lock(), PendingState::Attached(_))
    }

    /// Number of operations waiting for a backend.
    pub fn buffered_len(&self) -> usize {
        match &*self.lock() {
            PendingState::Buffering { log, .. } => log.len(),
            PendingState::Attached(_) => 0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        // A panic while holding this lock leaves the state consistent (every
        // mutation is a single push or swap), so poisoning is ignored.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `op` in the buffer, or hand back the backend to call directly.
    fn route(&self, op: CacheOp) -> Option<(Arc<dyn CacheStore>, CacheOp)> {
        let mut state = self.lock();
        match &mut *state {
            PendingState::Attached(backend) => Some((Arc::clone(backend), op)),
            PendingState::Buffering { log, view } => {
                debug!(op = op.name(), target_id = %op.target(), "pending cache buffered op");
                op.clone().apply(&*view);
                log.push(op);
                None
            }
        }
    }

    fn read<T>(
        &self,
        buffered: impl FnOnce(&MemoryCache) -> T,
        direct: impl FnOnce(&dyn CacheStore) -> T,
    ) -> T {
        let backend = {
            let state = self.lock();
            match &*state {
                PendingState::Buffering { view, .. } => return buffered(view),
                PendingState::Attached(backend) => Arc::clone(backend),
            }
        };
        direct(backend.as_ref())
    }
}

impl CacheStore for PendingCache {
    fn set(&self, target: EntityId, key: &str, value: CacheValue, dirty: bool) {
        let op = CacheOp::Set {
            target,
            key: key.to_string(),
            value,
            dirty,
        };
        if let Some((backend, op)) = self.route(op) {
            op.apply(backend.as_ref());
        }
    }

    fn get(&self, target: EntityId, key: &str) -> Option<CacheValue> {
        self.read(|view| view.get(target, key), |b| b.get(target, key))
    }

    fn remove(&self, target: EntityId, key: &str) {
        let op = CacheOp::Remove {
            target,
            key: key.to_string(),
        };
        if let Some((backend, op)) = self.route(op) {
            op.apply(backend.as_ref());
        }
    }

    fn is_dirty(&self, target: EntityId, key: &str) -> bool {
        self.read(|view| view.is_dirty(target, key), |b| b.is_dirty(target, key))
    }

    fn set_dirty(&self, target: EntityId, key: &str, dirty: bool) {
        let op = CacheOp::SetDirty {
            target,
            key: key.to_string(),
            dirty,
        };
        if let Some((backend, op)) = self.route(op) {
            op.apply(backend.as_ref());
        }
    }

    fn purge(&self, target: EntityId) {
        if let Some((backend, op)) = self.route(CacheOp::Purge { target }) {
            op.apply(backend.as_ref());
        }
    }

    fn suspend(&self) {
        self.read(|_| (), |b| b.suspend());
    }

    fn spill(&self) {
        self.read(|_| (), |b| b.spill());
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn reads_before_attach_use_buffer() {
        let cache = PendingCache::new();
        let t = Uuid::now_v7();
        cache.set(t, "k", json!(1), false);
        assert_eq!(cache.get(t, "k"), Some(json!(1)));
        assert!(!cache.is_dirty(t, "k"));
        assert_eq!(cache.buffered_len(), 1);
        assert!(!cache.is_attached());
    }

    #[test]
    fn attach_replays_in_order() {
        let cache = PendingCache::new();
        let t = Uuid::now_v7();
        cache.set(t, "k", json!(1), false);
        cache.set(t, "k", json!(2), false);
        cache.set(t, "gone", json!(3), false);
        cache.remove(t, "gone");
        cache.set_dirty(t, "k", true);

        let backend = Arc::new(MemoryCache::new());
        assert!(cache.attach(backend.clone()));

        assert_eq!(backend.get(t, "k"), Some(json!(2)));
        assert!(backend.is_dirty(t, "k"));
        assert!(!backend.contains(t, "gone"));
        assert_eq!(cache.buffered_len(), 0);
    }

    #[test]
    fn calls_after_attach_go_direct() {
        let cache = PendingCache::new();
        let backend = Arc::new(MemoryCache::new());
        cache.attach(backend.clone());

        let t = Uuid::now_v7();
        cache.set(t, "k", json!("v"), false);
        assert_eq!(backend.get(t, "k"), Some(json!("v")));
        assert_eq!(cache.get(t, "k"), Some(json!("v")));
    }

    #[test]
    fn second_attach_is_rejected() {
        let cache = PendingCache::new();
        let first = Arc::new(MemoryCache::new());
        let second = Arc::new(MemoryCache::new());
        assert!(cache.attach(first.clone()));
        assert!(!cache.attach(second.clone()));

        let t = Uuid::now_v7();
        cache.set(t, "k", json!(1), false);
        assert!(first.contains(t, "k"));
        assert!(!second.contains(t, "k"));
    }

    #[test]
    fn purge_before_attach_is_replayed() {
        let cache = PendingCache::new();
        let t = Uuid::now_v7();
        let backend = Arc::new(MemoryCache::new());
        backend.set(t, "old", json!(0), false);

        cache.purge(t);
        cache.set(t, "new", json!(1), false);
        cache.attach(backend.clone());

        assert!(!backend.contains(t, "old"));
        assert_eq!(backend.get(t, "new"), Some(json!(1)));
    }
}
