//! Entity registry.
//!
//! The registry owns every [`DataEntity`] and the dependency edges between
//! them. Entities refer to each other only by [`EntityId`]; an entity keeps
//! a non-owning pointer to the registry's arena to find its dependents when
//! it propagates staleness and transaction or live counts.
//!
//! Internally the arena is backed by [`DashMap`], so lookups never contend
//! on a global lock. Dependent lists are copied out before any entity is
//! called, so no map shard is held across a call that may re-enter the
//! registry.
//!
//! # Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use tiercache_engine::{EngineConfig, EntityRegistry, MemoryPayloadStore, Payload};
//! let payloads = Arc::new(MemoryPayloadStore::new());
//! let registry = EntityRegistry::new(EngineConfig::default()).with_payload_store(payloads);
//!
//! let source = registry.create(None);
//! let derived = registry.create(None);
//! let edge = registry.add_dependent(source.id(), derived.id()).unwrap();
//!
//! source.set_payload(Payload::from_values(vec![1.0, 2.0])).unwrap();
//! assert!(derived.is_stale());
//! edge.release().unwrap();
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock, Weak};

use dashmap::DashMap;
use tiercache_store::{
    CacheStore, DurableCache, EntityId, MemoryCache, PendingCache, SuspendingCache, TracingCache,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dispatch::Dispatch;
use crate::entity::DataEntity;
use crate::error::{EngineError, Result};
use crate::events::{EntityEvent, EventBus};
use crate::payload::{PayloadDescriptor, PayloadStore};
use crate::sync::{lock, read, write};

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// Entities plus `source -> dependents` edges.
#[derive(Default)]
pub(crate) struct RegistryInner {
    entities: DashMap<EntityId, Arc<DataEntity>>,
    edges: DashMap<EntityId, Vec<EntityId>>,
}

impl RegistryInner {
    /// Live dependents of `id`, one entry per edge.
    pub(crate) fn dependents_of(&self, id: EntityId) -> Vec<Arc<DataEntity>> {
        let ids: Vec<EntityId> = self
            .edges
            .get(&id)
            .map(|edges| edges.value().clone())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.entities.get(&id).map(|e| Arc::clone(e.value())))
            .collect()
    }

    fn entity(&self, id: EntityId) -> Option<Arc<DataEntity>> {
        self.entities.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Whether `to` is reachable from `from` along dependent edges.
    fn reaches(&self, from: EntityId, to: EntityId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(edges) = self.edges.get(&id) {
                stack.extend(edges.value().iter().copied());
            }
        }
        false
    }

    fn unlink(&self, source: EntityId, dependent: EntityId) -> bool {
        let Some(mut edges) = self.edges.get_mut(&source) else {
            return false;
        };
        match edges.iter().position(|id| *id == dependent) {
            Some(i) => {
                edges.remove(i);
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Owns entities, dependency edges, the shared cache stack and the
/// notification bus.
///
/// Every entity writes through its own [`SuspendingCache`] over the shared
/// stack, so a transaction only defers the writes of the entities it spans.
pub struct EntityRegistry {
    inner: Arc<RegistryInner>,
    config: Arc<EngineConfig>,
    bus: EventBus,
    cache: Arc<PendingCache>,
    overlays: DashMap<EntityId, Arc<SuspendingCache>>,
    payloads: RwLock<Option<Arc<dyn PayloadStore>>>,
    durable: Mutex<Option<Arc<DurableCache>>>,
}

impl EntityRegistry {
    /// Create an empty registry. Its cache buffers writes until a backend
    /// is attached.
    pub fn new(config: EngineConfig) -> Self {
        let bus = EventBus::new(config.event_capacity);
        Self {
            inner: Arc::new(RegistryInner::default()),
            config: Arc::new(config),
            bus,
            cache: Arc::new(PendingCache::new()),
            overlays: DashMap::new(),
            payloads: RwLock::new(None),
            durable: Mutex::new(None),
        }
    }

    /// Use `store` to load and persist payloads of entities created from
    /// now on.
    #[must_use]
    pub fn with_payload_store(self, store: Arc<dyn PayloadStore>) -> Self {
        *write(&self.payloads) = Some(store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The shared cache under every entity's transaction overlay.
    pub fn cache(&self) -> Arc<dyn CacheStore> {
        self.cache.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<EntityEvent>> {
        self.bus.subscribe()
    }

    // -- Cache stack --------------------------------------------------------

    /// Attach the cache backend, replaying writes buffered so far. Returns
    /// `false` if a backend was already attached.
    pub fn attach_cache(&self, backend: Arc<dyn CacheStore>) -> bool {
        if !self.cache.attach(backend) {
            warn!("cache backend already attached");
            return false;
        }
        for entity in self.entities() {
            entity.cache_backend_attached();
        }
        info!(entities = self.len(), "cache backend attached");
        true
    }

    /// Build the cache stack described by the configuration and attach it:
    /// a durable tier when `cache_path` is set (memory otherwise),
    /// optionally wrapped in a tracing tier.
    pub fn open_configured_cache(&self) -> Result<bool> {
        let base: Arc<dyn CacheStore> = match &self.config.cache_path {
            Some(path) => {
                let durable = Arc::new(DurableCache::open(path)?);
                *lock(&self.durable) = Some(Arc::clone(&durable));
                info!(path = %path.display(), "durable cache opened");
                durable
            }
            None => Arc::new(MemoryCache::new()),
        };
        let backend: Arc<dyn CacheStore> = if self.config.trace_cache {
            Arc::new(TracingCache::new("engine", base))
        } else {
            base
        };
        Ok(self.attach_cache(backend))
    }

    /// The durable tier opened by [`open_configured_cache`](Self::open_configured_cache).
    pub fn durable(&self) -> Option<Arc<DurableCache>> {
        lock(&self.durable).clone()
    }

    // -- Entities -----------------------------------------------------------

    /// Create an entity with a fresh id.
    pub fn create(&self, descriptor: Option<PayloadDescriptor>) -> Arc<DataEntity> {
        self.create_with_id(Uuid::now_v7(), descriptor)
    }

    /// Create an entity with a known id, e.g. to reconnect to records in a
    /// durable cache. An existing entity with that id is returned as is.
    pub fn create_with_id(
        &self,
        id: EntityId,
        descriptor: Option<PayloadDescriptor>,
    ) -> Arc<DataEntity> {
        let entry = self.inner.entities.entry(id).or_insert_with(|| {
            let entity = DataEntity::new(
                id,
                descriptor,
                self.bus.clone(),
                self.config.min_recompute_interval(),
                Arc::downgrade(&self.inner),
            );
            if let Some(store) = read(&self.payloads).clone() {
                entity.attach_store(store);
            }
            let shared: Arc<dyn CacheStore> = self.cache.clone();
            let overlay = Arc::new(SuspendingCache::new(shared));
            entity.attach_cache(overlay.clone());
            self.overlays.insert(id, overlay);
            debug!(entity_id = %id, "entity created");
            Arc::new(entity)
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, id: EntityId) -> Result<Arc<DataEntity>> {
        self.inner
            .entity(id)
            .ok_or(EngineError::EntityNotFound { entity_id: id })
    }

    /// Remove an entity: drop its edges, close its processors and purge its
    /// cache records, including writes its open transaction still defers.
    ///
    /// Dependents get back the transaction and live counts they inherited
    /// from it; handles for the dropped edges become no-ops.
    pub fn remove(&self, id: EntityId) -> Result<Arc<DataEntity>> {
        let (_, entity) = self
            .inner
            .entities
            .remove(&id)
            .ok_or(EngineError::EntityNotFound { entity_id: id })?;

        let dependents = self.inner.dependents_of(id);
        self.inner.edges.remove(&id);
        for mut edges in self.inner.edges.iter_mut() {
            edges.value_mut().retain(|dependent| *dependent != id);
        }

        let transactions = entity.transaction_count();
        let live = entity.live_count();
        for dependent in &dependents {
            dependent.end_live(live);
            if let Err(e) = dependent.end_transaction(transactions) {
                warn!(entity_id = %dependent.id(), error = %e, "dependent flush failed");
            }
        }

        entity.close();
        match self.overlays.remove(&id) {
            Some((_, overlay)) => {
                overlay.purge(id);
                overlay.flush();
            }
            None => self.cache.purge(id),
        }
        info!(entity_id = %id, dependents = dependents.len(), "entity removed");
        Ok(entity)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.inner.entities.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.inner.entities.iter().map(|e| *e.key()).collect()
    }

    pub fn entities(&self) -> Vec<Arc<DataEntity>> {
        self.inner
            .entities
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entities.is_empty()
    }

    // -- Dependencies -------------------------------------------------------

    /// Make `dependent` computed from `source`.
    ///
    /// The dependent immediately inherits the source's open transaction and
    /// live counts; releasing the handle gives them back.
    pub fn add_dependent(&self, source: EntityId, dependent: EntityId) -> Result<DependencyHandle> {
        let source_entity = self.get(source)?;
        let dependent_entity = self.get(dependent)?;
        if source == dependent || self.inner.reaches(dependent, source) {
            return Err(EngineError::DependencyCycle {
                source_id: source,
                dependent_id: dependent,
            });
        }

        self.inner.edges.entry(source).or_default().push(dependent);
        dependent_entity.begin_transaction(source_entity.transaction_count());
        dependent_entity.begin_live(source_entity.live_count());
        debug!(source_id = %source, dependent_id = %dependent, "dependency added");

        Ok(DependencyHandle {
            graph: Arc::downgrade(&self.inner),
            source,
            dependent,
            released: false,
        })
    }

    /// Ids of the entities computed from `id`.
    pub fn dependents(&self, id: EntityId) -> Vec<EntityId> {
        self.inner
            .edges
            .get(&id)
            .map(|edges| edges.value().clone())
            .unwrap_or_default()
    }

    /// Schedule recomputes for every dirty processor of every entity.
    pub fn recompute_stale(&self, dispatch: &Arc<dyn Dispatch>) -> usize {
        self.entities()
            .iter()
            .map(|entity| entity.recompute_stale(dispatch))
            .sum()
    }

    /// Flush every entity's deferred writes, including those of still open
    /// transactions, then close the durable tier, if any.
    pub fn close(&self) {
        for overlay in self.overlays.iter() {
            if overlay.is_suspended() {
                debug!(
                    entity_id = %overlay.key(),
                    buffered = overlay.buffered_len(),
                    "flushing open transaction on close"
                );
            }
            overlay.flush();
        }
        self.cache.spill();
        if let Some(durable) = lock(&self.durable).take() {
            durable.close();
        }
        info!(entities = self.len(), "registry closed");
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("entities", &self.len())
            .field("cache_attached", &self.cache.is_attached())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Dependency handle
// ---------------------------------------------------------------------------

/// A registered dependency edge. Call [`release`](Self::release) to remove
/// it; dropping an unreleased handle removes it with a warning.
#[must_use = "dropping the handle removes the dependency"]
pub struct DependencyHandle {
    graph: Weak<RegistryInner>,
    source: EntityId,
    dependent: EntityId,
    released: bool,
}

impl DependencyHandle {
    pub fn source(&self) -> EntityId {
        self.source
    }

    pub fn dependent(&self) -> EntityId {
        self.dependent
    }

    /// Remove the edge and hand back the counts the dependent inherited.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.unlink()
    }

    fn unlink(&self) -> Result<()> {
        let Some(graph) = self.graph.upgrade() else {
            return Ok(());
        };
        if !graph.unlink(self.source, self.dependent) {
            return Ok(());
        }
        debug!(source_id = %self.source, dependent_id = %self.dependent, "dependency released");

        let (Some(source), Some(dependent)) =
            (graph.entity(self.source), graph.entity(self.dependent))
        else {
            return Ok(());
        };
        dependent.end_live(source.live_count());
        dependent.end_transaction(source.transaction_count())
    }
}

impl Drop for DependencyHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            source_id = %self.source,
            dependent_id = %self.dependent,
            "dependency handle dropped without release"
        );
        if let Err(e) = self.unlink() {
            warn!(error = %e, "dependency release failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::RangeDerivation;
    use crate::payload::{MemoryPayloadStore, Payload};
    use serde_json::json;

    fn registry() -> (EntityRegistry, Arc<MemoryPayloadStore>) {
        let payloads = Arc::new(MemoryPayloadStore::new());
        let registry =
            EntityRegistry::new(EngineConfig::default()).with_payload_store(payloads.clone());
        (registry, payloads)
    }

    #[test]
    fn create_and_get() {
        let (registry, _) = registry();
        let entity = registry.create(Some(PayloadDescriptor::vector(3)));

        let fetched = registry.get(entity.id()).expect("entity should exist");
        assert!(Arc::ptr_eq(&entity, &fetched));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(entity.id()));
    }

    #[test]
    fn create_with_id_is_idempotent() {
        let (registry, _) = registry();
        let id = Uuid::now_v7();
        let a = registry.create_with_id(id, None);
        let b = registry.create_with_id(id, Some(PayloadDescriptor::vector(1)));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn not_found_error() {
        let (registry, _) = registry();
        let result = registry.get(Uuid::now_v7());
        assert!(matches!(result, Err(EngineError::EntityNotFound { .. })));
    }

    #[test]
    fn self_and_cyclic_edges_rejected() {
        let (registry, _) = registry();
        let a = registry.create(None);
        let b = registry.create(None);
        let c = registry.create(None);

        assert!(matches!(
            registry.add_dependent(a.id(), a.id()),
            Err(EngineError::DependencyCycle { .. })
        ));

        let ab = registry.add_dependent(a.id(), b.id()).unwrap();
        let bc = registry.add_dependent(b.id(), c.id()).unwrap();
        assert!(matches!(
            registry.add_dependent(c.id(), a.id()),
            Err(EngineError::DependencyCycle { .. })
        ));

        ab.release().unwrap();
        bc.release().unwrap();
        assert!(registry.dependents(a.id()).is_empty());
    }

    #[test]
    fn staleness_cascades_to_dependents() {
        let (registry, payloads) = registry();
        let source = registry.create(None);
        let middle = registry.create(None);
        let leaf = registry.create(None);
        payloads.insert(leaf.id(), Payload::from_values(vec![1.0]));
        let range = leaf.add_processor("range", RangeDerivation);
        range.recompute(&leaf);
        assert!(!range.is_dirty());

        let e1 = registry.add_dependent(source.id(), middle.id()).unwrap();
        let e2 = registry.add_dependent(middle.id(), leaf.id()).unwrap();

        source.mark_stale();
        assert!(middle.is_stale());
        assert!(leaf.is_stale());
        assert!(range.is_dirty());

        e1.release().unwrap();
        e2.release().unwrap();
    }

    #[test]
    fn transactions_propagate_and_are_inherited() {
        let (registry, _) = registry();
        let source = registry.create(None);
        let dependent = registry.create(None);

        source.begin_transaction(2);
        let edge = registry.add_dependent(source.id(), dependent.id()).unwrap();
        assert_eq!(dependent.transaction_count(), 2);

        source.begin_transaction(1);
        assert_eq!(dependent.transaction_count(), 3);
        source.end_transaction(1).unwrap();
        assert_eq!(dependent.transaction_count(), 2);

        edge.release().unwrap();
        assert_eq!(dependent.transaction_count(), 0);
        assert_eq!(dependent.flush_count(), 1);
        source.end_transaction(2).unwrap();
    }

    #[test]
    fn live_counts_propagate() {
        let (registry, _) = registry();
        let source = registry.create(None);
        let dependent = registry.create(None);
        let edge = registry.add_dependent(source.id(), dependent.id()).unwrap();

        source.begin_live(1);
        assert!(dependent.is_live());
        source.end_live(1);
        assert!(!dependent.is_live());
        edge.release().unwrap();
    }

    #[test]
    fn dropped_handle_still_unlinks() {
        let (registry, _) = registry();
        let source = registry.create(None);
        let dependent = registry.create(None);
        source.begin_live(1);
        {
            let _edge = registry.add_dependent(source.id(), dependent.id()).unwrap();
            assert_eq!(dependent.live_count(), 1);
        }
        assert!(registry.dependents(source.id()).is_empty());
        assert_eq!(dependent.live_count(), 0);
    }

    #[test]
    fn remove_purges_cache_and_edges() {
        let (registry, payloads) = registry();
        let memory = Arc::new(MemoryCache::new());
        registry.attach_cache(memory.clone());

        let source = registry.create(None);
        let entity = registry.create(None);
        payloads.insert(entity.id(), Payload::from_values(vec![2.0, 4.0]));
        let range = entity.add_processor("range", RangeDerivation);
        range.recompute(&entity);
        assert_eq!(memory.get(entity.id(), "range"), Some(json!({"min": 2.0, "max": 4.0})));

        let edge = registry.add_dependent(source.id(), entity.id()).unwrap();
        registry.remove(entity.id()).unwrap();

        assert!(range.is_closed());
        assert!(memory.keys(entity.id()).is_empty());
        assert!(registry.dependents(source.id()).is_empty());
        assert!(matches!(
            registry.remove(entity.id()),
            Err(EngineError::EntityNotFound { .. })
        ));
        edge.release().unwrap();
    }

    #[test]
    fn removing_source_returns_inherited_counts() {
        let (registry, payloads) = registry();
        let source = registry.create(None);
        let dependent = registry.create(None);
        let edge = registry.add_dependent(source.id(), dependent.id()).unwrap();

        source.begin_transaction(1);
        source.begin_live(1);
        assert_eq!(dependent.transaction_count(), 1);
        assert!(dependent.is_live());

        registry.remove(source.id()).unwrap();
        assert_eq!(dependent.transaction_count(), 0);
        assert_eq!(dependent.live_count(), 0);
        assert_eq!(dependent.flush_count(), 1);

        // The edge is gone; releasing it must not take the counts again.
        edge.release().unwrap();
        assert_eq!(dependent.transaction_count(), 0);

        dependent.set_payload(Payload::from_values(vec![1.0])).unwrap();
        assert_eq!(payloads.writes(), 1);
    }

    #[test]
    fn transaction_defers_only_its_own_writes() {
        let (registry, payloads) = registry();
        let memory = Arc::new(MemoryCache::new());
        registry.attach_cache(memory.clone());

        let busy = registry.create(None);
        let follower = registry.create(None);
        let other = registry.create(None);
        let edge = registry.add_dependent(busy.id(), follower.id()).unwrap();
        for entity in [&busy, &other] {
            payloads.insert(entity.id(), Payload::from_values(vec![3.0]));
        }
        let busy_range = busy.add_processor("range", RangeDerivation);
        let other_range = other.add_processor("range", RangeDerivation);

        busy.begin_transaction(1);
        busy_range.recompute(&busy);
        other_range.recompute(&other);

        let expected = json!({"min": 3.0, "max": 3.0});
        assert_eq!(memory.get(other.id(), "range"), Some(expected.clone()));
        assert_eq!(memory.get(busy.id(), "range"), None);
        // The deferred write is visible through the entity itself.
        assert_eq!(busy.cache().unwrap().get(busy.id(), "range"), Some(expected.clone()));

        registry.close();
        assert_eq!(memory.get(busy.id(), "range"), Some(expected));

        busy.end_transaction(1).unwrap();
        edge.release().unwrap();
    }

    #[test]
    fn writes_before_attach_are_replayed() {
        let (registry, payloads) = registry();
        let entity = registry.create(None);
        payloads.insert(entity.id(), Payload::from_values(vec![7.0]));
        let range = entity.add_processor("range", RangeDerivation);
        range.recompute(&entity);

        let memory = Arc::new(MemoryCache::new());
        assert!(registry.attach_cache(memory.clone()));
        assert!(!registry.attach_cache(Arc::new(MemoryCache::new())));

        assert_eq!(memory.get(entity.id(), "range"), Some(json!({"min": 7.0, "max": 7.0})));
        assert!(!range.is_dirty());
    }

    #[test]
    fn open_configured_cache_in_memory() {
        let (registry, _) = registry();
        assert!(registry.open_configured_cache().unwrap());
        assert!(registry.durable().is_none());
        registry.close();
    }
}
