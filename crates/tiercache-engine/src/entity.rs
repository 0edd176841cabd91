//! Data entities: payload lifecycle, transactions and staleness.
//!
//! A [`DataEntity`] owns an optional bulk [`Payload`] that is loaded on the
//! first [`acquire`](DataEntity::acquire) and unloaded on the last
//! [`release`](DataEntity::release), unless a transaction is open. Every
//! mutable field sits behind its own short-held lock; locks are taken in the
//! order references → transaction → payload, and no lock is held while
//! calling the payload store, a dependent entity or the event bus.
//!
//! Transaction and live counts propagate to dependents through the owning
//! registry's edge list, so gripping an entity grips everything computed
//! from it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Duration;

use tiercache_store::{CacheStore, CacheValue, EntityId};
use tracing::{debug, error, trace, warn};

use crate::derive::Derivation;
use crate::dispatch::Dispatch;
use crate::error::Result;
use crate::events::{ChangeKind, ChangeSet, EntityEvent, EventBus};
use crate::payload::{Payload, PayloadDescriptor, PayloadStore, ValueRange};
use crate::processor::DerivedValueProcessor;
use crate::registry::RegistryInner;
use crate::sync::{lock, read, write};

#[derive(Debug, Default)]
struct RefState {
    count: usize,
    /// A thread is loading the payload with no lock held.
    loading: bool,
}

#[derive(Debug, Default)]
struct ChangeState {
    depth: usize,
    pending: ChangeSet,
}

/// One data-bearing entity.
pub struct DataEntity {
    id: EntityId,
    descriptor: RwLock<Option<PayloadDescriptor>>,
    refs: Mutex<RefState>,
    loaded: Condvar,
    transaction: Mutex<usize>,
    payload: Mutex<Option<Arc<Payload>>>,
    stale: Mutex<bool>,
    live: Mutex<usize>,
    changes: Mutex<ChangeState>,
    range: Mutex<Option<ValueRange>>,
    processors: Mutex<Vec<Arc<DerivedValueProcessor>>>,
    cache: RwLock<Option<Arc<dyn CacheStore>>>,
    store: RwLock<Option<Arc<dyn PayloadStore>>>,
    bus: EventBus,
    min_interval: Duration,
    graph: Weak<RegistryInner>,
    flushes: AtomicUsize,
}

impl DataEntity {
    pub(crate) fn new(
        id: EntityId,
        descriptor: Option<PayloadDescriptor>,
        bus: EventBus,
        min_interval: Duration,
        graph: Weak<RegistryInner>,
    ) -> Self {
        Self {
            id,
            descriptor: RwLock::new(descriptor),
            refs: Mutex::new(RefState::default()),
            loaded: Condvar::new(),
            transaction: Mutex::new(0),
            payload: Mutex::new(None),
            stale: Mutex::new(false),
            live: Mutex::new(0),
            changes: Mutex::new(ChangeState::default()),
            range: Mutex::new(None),
            processors: Mutex::new(Vec::new()),
            cache: RwLock::new(None),
            store: RwLock::new(None),
            bus,
            min_interval,
            graph,
            flushes: AtomicUsize::new(0),
        }
    }

    // -- Accessors ----------------------------------------------------------

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn descriptor(&self) -> Option<PayloadDescriptor> {
        read(&self.descriptor).clone()
    }

    /// Range of the most recently set or loaded payload.
    pub fn range(&self) -> Option<ValueRange> {
        *lock(&self.range)
    }

    pub fn reference_count(&self) -> usize {
        lock(&self.refs).count
    }

    pub fn transaction_count(&self) -> usize {
        *lock(&self.transaction)
    }

    pub fn live_count(&self) -> usize {
        *lock(&self.live)
    }

    pub fn is_live(&self) -> bool {
        self.live_count() > 0
    }

    pub fn is_stale(&self) -> bool {
        *lock(&self.stale)
    }

    /// Whether the payload is resident in memory.
    pub fn is_loaded(&self) -> bool {
        lock(&self.payload).is_some()
    }

    /// Number of outermost transactions closed so far.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Acquire)
    }

    /// Cache tier currently attached to this entity.
    pub fn cache(&self) -> Option<Arc<dyn CacheStore>> {
        read(&self.cache).clone()
    }

    fn store(&self) -> Option<Arc<dyn PayloadStore>> {
        read(&self.store).clone()
    }

    pub(crate) fn publish(&self, event: EntityEvent) {
        self.bus.publish(event);
    }

    // -- Collaborators ------------------------------------------------------

    /// Attach a cache tier. Processor mirrors are reloaded from it.
    pub fn attach_cache(&self, cache: Arc<dyn CacheStore>) {
        let previous = write(&self.cache).replace(Arc::clone(&cache));
        if self.transaction_count() > 0 {
            cache.suspend();
            if let Some(previous) = previous {
                previous.spill();
            }
        }
        for processor in self.processors() {
            processor.hydrate(cache.as_ref());
        }
        if self.is_stale() {
            self.mark_processors_dirty();
        }
        debug!(entity_id = %self.id, "cache attached");
    }

    /// The shared cache under this entity got a backend: reload processor
    /// mirrors from it.
    pub(crate) fn cache_backend_attached(&self) {
        let Some(cache) = self.cache() else {
            return;
        };
        for processor in self.processors() {
            processor.hydrate(cache.as_ref());
        }
        if self.is_stale() {
            self.mark_processors_dirty();
        }
    }

    /// Attach the store that loads and persists the payload.
    pub fn attach_store(&self, store: Arc<dyn PayloadStore>) {
        *write(&self.store) = Some(store);
        debug!(entity_id = %self.id, "payload store attached");
    }

    // -- References ---------------------------------------------------------

    /// Take a reference on the payload, loading it on the 0→1 transition.
    ///
    /// Returns the new reference count. A failed load leaves the count
    /// unchanged and propagates the error.
    pub fn acquire(&self) -> Result<usize> {
        let mut refs = lock(&self.refs);
        while refs.loading {
            refs = self.loaded.wait(refs).unwrap_or_else(|e| e.into_inner());
        }

        if refs.count == 0 && !self.is_loaded() {
            if let Some(store) = self.store() {
                refs.loading = true;
                drop(refs);

                trace!(entity_id = %self.id, "loading payload");
                let loaded = store.load(self.id);

                let mut refs = lock(&self.refs);
                refs.loading = false;
                self.loaded.notify_all();
                let payload = loaded?;
                self.install_loaded(payload);
                refs.count += 1;
                debug!(entity_id = %self.id, "payload loaded");
                return Ok(refs.count);
            }
        }

        refs.count += 1;
        Ok(refs.count)
    }

    /// Drop a reference. On the last one, with no transaction open, the
    /// payload is unloaded. Returns the remaining count.
    pub fn release(&self) -> usize {
        let (remaining, unloaded) = {
            let mut refs = lock(&self.refs);
            debug_assert!(refs.count > 0, "release without matching acquire");
            if refs.count == 0 {
                warn!(entity_id = %self.id, "release without matching acquire");
                return 0;
            }
            refs.count -= 1;
            let unloaded = if refs.count == 0 {
                self.take_payload_if_idle()
            } else {
                None
            };
            (refs.count, unloaded)
        };

        if let Some(store) = unloaded {
            store.unload(self.id);
            debug!(entity_id = %self.id, "payload unloaded");
        }
        remaining
    }

    /// Scoped reference: acquired now, released when the lease drops.
    pub fn lease(&self) -> Result<PayloadLease<'_>> {
        self.acquire()?;
        Ok(PayloadLease { entity: self })
    }

    fn install_loaded(&self, payload: Payload) {
        let mut slot = lock(&self.payload);
        // A concurrent set_payload wins over the stored copy.
        if slot.is_none() {
            *write(&self.descriptor) = Some(payload.descriptor().clone());
            *lock(&self.range) = payload.range();
            *slot = Some(Arc::new(payload));
        }
    }

    /// Caller holds the references lock with a zero count.
    fn take_payload_if_idle(&self) -> Option<Arc<dyn PayloadStore>> {
        let store = self.store()?;
        if *lock(&self.transaction) > 0 {
            return None;
        }
        lock(&self.payload).take().map(|_| store)
    }

    fn unload_if_unreferenced(&self) {
        let unloaded = {
            let refs = lock(&self.refs);
            if refs.count > 0 || refs.loading {
                return;
            }
            self.take_payload_if_idle()
        };
        if let Some(store) = unloaded {
            store.unload(self.id);
            debug!(entity_id = %self.id, "payload unloaded");
        }
    }

    fn current_payload(&self) -> Option<Arc<Payload>> {
        lock(&self.payload).clone()
    }

    // -- Transactions -------------------------------------------------------

    /// Open `n` transaction levels. Cache writes and payload persistence
    /// are deferred until the count returns to zero.
    pub fn begin_transaction(&self, n: usize) {
        if n == 0 {
            return;
        }
        let opened = {
            let mut count = lock(&self.transaction);
            let opened = *count == 0;
            *count += n;
            opened
        };
        if opened {
            if let Some(cache) = self.cache() {
                cache.suspend();
            }
            debug!(entity_id = %self.id, "transaction opened");
        }
        self.for_each_dependent(|dependent| dependent.begin_transaction(n));
    }

    /// Close `n` transaction levels. On the last one the cache is spilled,
    /// the payload is written in full and then unloaded if unreferenced.
    ///
    /// Persistence errors are returned after the count has been updated.
    pub fn end_transaction(&self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let closed = {
            let mut count = lock(&self.transaction);
            debug_assert!(*count >= n, "transaction count would go negative");
            let n = n.min(*count);
            *count -= n;
            n > 0 && *count == 0
        };

        let mut result = Ok(());
        if closed {
            if let Some(cache) = self.cache() {
                cache.spill();
            }
            if let Some(payload) = self.current_payload() {
                result = self.persist(&payload);
            }
            self.unload_if_unreferenced();
            self.flushes.fetch_add(1, Ordering::AcqRel);
            debug!(entity_id = %self.id, "transaction closed, flushed");
            self.publish(EntityEvent::Flushed { entity_id: self.id });
        }

        self.for_each_dependent(|dependent| {
            if let Err(e) = dependent.end_transaction(n) {
                error!(entity_id = %dependent.id(), error = %e, "dependent flush failed");
            }
        });
        result
    }

    fn persist(&self, payload: &Payload) -> Result<()> {
        let Some(store) = self.store() else {
            return Ok(());
        };
        store.write(self.id, payload).inspect_err(|e| {
            error!(entity_id = %self.id, error = %e, "payload write failed");
        })
    }

    // -- Liveness -----------------------------------------------------------

    pub fn begin_live(&self, n: usize) {
        if n == 0 {
            return;
        }
        let became_live = {
            let mut live = lock(&self.live);
            let was = *live;
            *live += n;
            was == 0
        };
        if became_live {
            self.publish(EntityEvent::LivenessChanged {
                entity_id: self.id,
                live: true,
            });
        }
        self.for_each_dependent(|dependent| dependent.begin_live(n));
    }

    pub fn end_live(&self, n: usize) {
        if n == 0 {
            return;
        }
        let became_dead = {
            let mut live = lock(&self.live);
            debug_assert!(*live >= n, "live count would go negative");
            let n = n.min(*live);
            *live -= n;
            n > 0 && *live == 0
        };
        if became_dead {
            self.publish(EntityEvent::LivenessChanged {
                entity_id: self.id,
                live: false,
            });
        }
        self.for_each_dependent(|dependent| dependent.end_live(n));
    }

    // -- Staleness and content ----------------------------------------------

    /// Mark the entity stale, dirtying its processors and its dependents.
    /// Returns `false` if it was already stale.
    pub fn mark_stale(&self) -> bool {
        {
            let mut stale = lock(&self.stale);
            if *stale {
                return false;
            }
            *stale = true;
        }
        trace!(entity_id = %self.id, "entity marked stale");
        self.mark_processors_dirty();
        self.publish(EntityEvent::NeedsRecompute { entity_id: self.id });
        self.for_each_dependent(|dependent| {
            dependent.mark_stale();
        });
        true
    }

    /// Replace the payload.
    ///
    /// Clears the stale flag, refreshes the range, dirties processors and
    /// dependents, and persists the payload unless a transaction is open.
    /// One [`EntityEvent::ContentChanged`] is published when the outermost
    /// change scope closes.
    pub fn set_payload(&self, payload: Payload) -> Result<()> {
        let scope = self.begin_change();
        let payload = Arc::new(payload);

        let descriptor_changed = {
            let mut descriptor = write(&self.descriptor);
            let changed = descriptor.as_ref() != Some(payload.descriptor());
            *descriptor = Some(payload.descriptor().clone());
            changed
        };
        let range_changed = {
            let range = payload.range();
            let mut current = lock(&self.range);
            let changed = *current != range;
            *current = range;
            changed
        };
        *lock(&self.payload) = Some(Arc::clone(&payload));
        *lock(&self.stale) = false;

        scope.note(ChangeKind::Payload);
        if descriptor_changed {
            scope.note(ChangeKind::Descriptor);
        }
        if range_changed {
            scope.note(ChangeKind::Range);
        }

        self.mark_processors_dirty();
        self.for_each_dependent(|dependent| {
            dependent.mark_stale();
        });

        let result = if self.transaction_count() == 0 {
            let result = self.persist(&payload);
            self.unload_if_unreferenced();
            result
        } else {
            trace!(entity_id = %self.id, "payload write deferred to transaction end");
            Ok(())
        };
        drop(scope);
        result
    }

    /// Open a change scope. Changes noted until the outermost scope closes
    /// are published as one event.
    pub fn begin_change(&self) -> ChangeScope<'_> {
        lock(&self.changes).depth += 1;
        ChangeScope { entity: self }
    }

    /// Record a change. Outside any scope it is published immediately.
    pub fn note_change(&self, kind: ChangeKind) {
        let ready = {
            let mut changes = lock(&self.changes);
            changes.pending.insert(kind);
            if changes.depth == 0 {
                Some(std::mem::take(&mut changes.pending))
            } else {
                None
            }
        };
        if let Some(changes) = ready {
            self.publish_changes(changes);
        }
    }

    fn end_change(&self) {
        let ready = {
            let mut changes = lock(&self.changes);
            debug_assert!(changes.depth > 0, "change scope underflow");
            changes.depth = changes.depth.saturating_sub(1);
            if changes.depth == 0 && !changes.pending.is_empty() {
                Some(std::mem::take(&mut changes.pending))
            } else {
                None
            }
        };
        if let Some(changes) = ready {
            self.publish_changes(changes);
        }
    }

    fn publish_changes(&self, changes: ChangeSet) {
        trace!(entity_id = %self.id, ?changes, "content changed");
        self.publish(EntityEvent::ContentChanged {
            entity_id: self.id,
            changes,
        });
    }

    // -- Processors ---------------------------------------------------------

    /// Register a derived value under `key`, replacing any processor with
    /// the same key.
    pub fn add_processor(
        &self,
        key: impl Into<String>,
        derivation: impl Derivation + 'static,
    ) -> Arc<DerivedValueProcessor> {
        let processor = Arc::new(DerivedValueProcessor::new(
            self.id,
            key,
            Box::new(derivation),
            self.min_interval,
        ));
        let cache = self.cache();
        if let Some(cache) = &cache {
            processor.hydrate(cache.as_ref());
        }
        if self.is_stale() {
            processor.mark_dirty(cache.as_deref());
        }

        let replaced = {
            let mut processors = lock(&self.processors);
            let replaced = processors
                .iter()
                .position(|p| p.key() == processor.key())
                .map(|i| processors.remove(i));
            processors.push(Arc::clone(&processor));
            replaced
        };
        if let Some(old) = replaced {
            old.close();
        }
        debug!(entity_id = %self.id, key = %processor.key(), "processor added");
        processor
    }

    pub fn processor(&self, key: &str) -> Option<Arc<DerivedValueProcessor>> {
        lock(&self.processors)
            .iter()
            .find(|p| p.key() == key)
            .cloned()
    }

    pub fn processors(&self) -> Vec<Arc<DerivedValueProcessor>> {
        lock(&self.processors).clone()
    }

    /// Mirrored value of processor `key`, or its default.
    pub fn cached_value(&self, key: &str) -> Option<CacheValue> {
        let processor = self.processor(key)?;
        processor.get_cached(self.descriptor().as_ref())
    }

    /// Schedule recomputes for every dirty processor. Returns how many were
    /// scheduled.
    pub fn recompute_stale(self: &Arc<Self>, dispatch: &Arc<dyn Dispatch>) -> usize {
        self.processors()
            .iter()
            .filter(|p| p.recompute_if_necessary(self, dispatch))
            .count()
    }

    fn mark_processors_dirty(&self) {
        let cache = self.cache();
        for processor in self.processors() {
            processor.mark_dirty(cache.as_deref());
        }
    }

    /// Close every processor. Used when the entity is removed.
    pub(crate) fn close(&self) {
        let processors = std::mem::take(&mut *lock(&self.processors));
        for processor in processors {
            processor.close();
        }
        debug!(entity_id = %self.id, "entity closed");
    }

    // -- Graph --------------------------------------------------------------

    fn for_each_dependent(&self, f: impl Fn(&DataEntity)) {
        let Some(graph) = self.graph.upgrade() else {
            return;
        };
        for dependent in graph.dependents_of(self.id) {
            f(&*dependent);
        }
    }
}

impl std::fmt::Debug for DataEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataEntity")
            .field("id", &self.id)
            .field("references", &self.reference_count())
            .field("transactions", &self.transaction_count())
            .field("live", &self.live_count())
            .field("stale", &self.is_stale())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// A held reference on an entity's payload.
#[must_use = "the payload is released when the lease is dropped"]
pub struct PayloadLease<'a> {
    entity: &'a DataEntity,
}

impl PayloadLease<'_> {
    /// The resident payload. `None` when the entity has no payload store
    /// and no payload was ever set.
    pub fn payload(&self) -> Option<Arc<Payload>> {
        self.entity.current_payload()
    }

    /// Replace the payload through the lease.
    pub fn replace(&self, payload: Payload) -> Result<()> {
        self.entity.set_payload(payload)
    }
}

impl Drop for PayloadLease<'_> {
    fn drop(&mut self) {
        self.entity.release();
    }
}

/// An open change scope.
#[must_use = "changes are published when the scope is dropped"]
pub struct ChangeScope<'a> {
    entity: &'a DataEntity,
}

impl ChangeScope<'_> {
    pub fn note(&self, kind: ChangeKind) {
        self.entity.note_change(kind);
    }
}

impl Drop for ChangeScope<'_> {
    fn drop(&mut self) {
        self.entity.end_change();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
