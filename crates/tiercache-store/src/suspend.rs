//! Transaction-suspending overlay tier.
//!
//! [`SuspendingCache`] wraps a backend. While suspended, mutations collect
//! in a per-target buffer instead of reaching the backend:
//!
//! - the last write to a key wins;
//! - a removal overrides any earlier buffered write for that key;
//! - a purge drops everything buffered for the target and hides the
//!   backend's records for it until the buffer is spilled.
//!
//! Reads consult the buffer first and fall through to the backend.
//! Suspension nests: every [`suspend`](CacheStore::suspend) must be matched
//! by a [`spill`](CacheStore::spill), and the buffer is replayed when the
//! outermost level closes. [`SuspendingCache::flush`] replays regardless of
//! depth.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::tier::{CacheStore, CacheValue, EntityId};

/// Buffered state of a single key.
#[derive(Debug, Clone, PartialEq)]
enum Pending {
    Write { value: CacheValue, dirty: bool },
    Removed,
    /// Only the dirty flag changed; the value still lives in the backend.
    Flag(bool),
}

#[derive(Debug, Default)]
struct TargetBuffer {
    purged: bool,
    keys: HashMap<String, Pending>,
}

#[derive(Debug, Default)]
struct SuspendState {
    depth: usize,
    buffer: HashMap<EntityId, TargetBuffer>,
}

impl SuspendState {
    fn entry(&mut self, target: EntityId) -> &mut TargetBuffer {
        self.buffer.entry(target).or_default()
    }
}

/// What a read found in the buffer.
enum Lookup {
    Hit(Pending),
    /// The target was purged and the key was not written since.
    Hidden,
    Miss,
}

/// A [`CacheStore`] overlay that defers writes while suspended.
pub struct SuspendingCache {
    backend: Arc<dyn CacheStore>,
    state: Mutex<SuspendState>,
}

impl SuspendingCache {
    /// Wrap `backend`. The overlay starts unsuspended.
    pub fn new(backend: Arc<dyn CacheStore>) -> Self {
        Self {
            backend,
            state: Mutex::new(SuspendState::default()),
        }
    }

    /// Whether at least one suspension level is open.
    pub fn is_suspended(&self) -> bool {
        self.lock().depth > 0
    }

    /// Current suspension depth.
    pub fn depth(&self) -> usize {
        self.lock().depth
    }

    /// Number of buffered key entries across all targets.
    pub fn buffered_len(&self) -> usize {
        self.lock().buffer.values().map(|b| b.keys.len()).sum()
    }

    /// Replay the buffer now, keeping the current suspension depth.
    pub fn flush(&self) {
        let mut state = self.lock();
        self.replay(&mut state);
    }

    fn lock(&self) -> MutexGuard<'_, SuspendState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drain the buffer into the backend.
    ///
    /// Runs with the state lock held so readers never observe a half-spilled
    /// buffer and direct writes cannot overtake buffered ones.
    fn replay(&self, state: &mut SuspendState) {
        let buffer = std::mem::take(&mut state.buffer);
        if buffer.is_empty() {
            return;
        }
        let mut applied = 0usize;
        for (target, entry) in buffer {
            if entry.purged {
                self.backend.purge(target);
                applied += 1;
            }
            for (key, pending) in entry.keys {
                match pending {
                    Pending::Write { value, dirty } => self.backend.set(target, &key, value, dirty),
                    Pending::Removed => self.backend.remove(target, &key),
                    Pending::Flag(dirty) => self.backend.set_dirty(target, &key, dirty),
                }
                applied += 1;
            }
        }
        debug!(applied, "suspending cache spilled");
        self.backend.spill();
    }

    fn lookup(&self, target: EntityId, key: &str) -> Lookup {
        let state = self.lock();
        if state.depth == 0 {
            return Lookup::Miss;
        }
        match state.buffer.get(&target) {
            None => Lookup::Miss,
            Some(entry) => match entry.keys.get(key) {
                Some(Pending::Flag(_)) if entry.purged => Lookup::Hidden,
                Some(pending) => Lookup::Hit(pending.clone()),
                None if entry.purged => Lookup::Hidden,
                None => Lookup::Miss,
            },
        }
    }

    /// Buffer a mutation if suspended; returns `false` when the caller must
    /// apply it to the backend directly.
    fn buffer(
        &self,
        target: EntityId,
        key: &str,
        update: impl FnOnce(Option<Pending>) -> Pending,
    ) -> bool {
        let mut state = self.lock();
        if state.depth == 0 {
            return false;
        }
        let entry = state.entry(target);
        let previous = entry.keys.remove(key);
        let next = update(previous);
        trace!(target_id = %target, key, pending = ?next, "suspending cache buffered");
        entry.keys.insert(key.to_string(), next);
        true
    }
}

impl CacheStore for SuspendingCache {
    fn set(&self, target: EntityId, key: &str, value: CacheValue, dirty: bool) {
        {
            let mut state = self.lock();
            if state.depth > 0 {
                trace!(target_id = %target, key, dirty, "suspending cache buffered write");
                state
                    .entry(target)
                    .keys
                    .insert(key.to_string(), Pending::Write { value, dirty });
                return;
            }
        }
        self.backend.set(target, key, value, dirty);
    }

    fn get(&self, target: EntityId, key: &str) -> Option<CacheValue> {
        match self.lookup(target, key) {
            Lookup::Hit(Pending::Write { value, .. }) => Some(value),
            Lookup::Hit(Pending::Removed) | Lookup::Hidden => None,
            Lookup::Hit(Pending::Flag(_)) | Lookup::Miss => self.backend.get(target, key),
        }
    }

    fn remove(&self, target: EntityId, key: &str) {
        if !self.buffer(target, key, |_| Pending::Removed) {
            self.backend.remove(target, key);
        }
    }

    fn is_dirty(&self, target: EntityId, key: &str) -> bool {
        match self.lookup(target, key) {
            Lookup::Hit(Pending::Write { dirty, .. }) => dirty,
            Lookup::Hit(Pending::Removed) | Lookup::Hidden => true,
            // A flag over a missing backend value is still dirty.
            Lookup::Hit(Pending::Flag(dirty)) => dirty || self.backend.get(target, key).is_none(),
            Lookup::Miss => self.backend.is_dirty(target, key),
        }
    }

    fn set_dirty(&self, target: EntityId, key: &str, dirty: bool) {
        let buffered = self.buffer(target, key, |previous| match previous {
            Some(Pending::Write { value, .. }) => Pending::Write { value, dirty },
            Some(Pending::Removed) => Pending::Removed,
            Some(Pending::Flag(_)) | None => Pending::Flag(dirty),
        });
        if !buffered {
            self.backend.set_dirty(target, key, dirty);
        }
    }

    fn purge(&self, target: EntityId) {
        {
            let mut state = self.lock();
            if state.depth > 0 {
                let entry = state.entry(target);
                entry.keys.clear();
                entry.purged = true;
                trace!(target_id = %target, "suspending cache buffered purge");
                return;
            }
        }
        self.backend.purge(target);
    }

    fn suspend(&self) {
        let mut state = self.lock();
        state.depth += 1;
        trace!(depth = state.depth, "suspending cache suspended");
    }

    fn spill(&self) {
        let mut state = self.lock();
        match state.depth {
            0 => {
                debug!("spill without matching suspend");
                self.replay(&mut state);
            }
            1 => {
                state.depth = 0;
                self.replay(&mut state);
            }
            _ => {
                state.depth -= 1;
                trace!(depth = state.depth, "suspending cache spill deferred to outer level");
            }
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
