//! Derived-value processors.
//!
//! A [`DerivedValueProcessor`] owns one named derived value of one entity.
//! It keeps an in-process mirror of the cache record (value, dirty flag,
//! last compute time) so [`DerivedValueProcessor::get_cached`] never touches
//! a cache tier, and it guarantees that at most one recompute per processor
//! is queued or running at any time.
//!
//! # Recompute policy
//!
//! ```text
//! mark_dirty ──> recompute_if_necessary ──(delay)──> recompute ──> clean
//!                     │                                  │
//!                     └─ no-op while in flight            └─ dirtied meanwhile?
//!                                                             re-dispatch
//! ```
//!
//! The delay keeps consecutive recomputes of the same key at least
//! `min_recompute_interval` apart. A trigger that arrives while a job is in
//! flight is not lost: the job re-dispatches itself after clearing the
//! in-flight flag if the value was dirtied at any point since it started.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tiercache_store::{CacheStore, CacheValue, EntityId};
use tracing::{debug, error, trace, warn};

use crate::derive::Derivation;
use crate::dispatch::Dispatch;
use crate::entity::DataEntity;
use crate::events::EntityEvent;
use crate::payload::PayloadDescriptor;
use crate::sync::lock;

#[derive(Debug, Default)]
struct Mirror {
    value: Option<CacheValue>,
    dirty: bool,
    /// Bumped by every `mark_dirty`; a recompute only marks the value clean
    /// if no dirtying happened while it ran.
    generation: u64,
    computed_at: Option<Instant>,
    computed_utc: Option<DateTime<Utc>>,
}

/// Computes and caches one named derived value of an entity.
pub struct DerivedValueProcessor {
    owner: EntityId,
    key: String,
    derivation: Box<dyn Derivation>,
    mirror: Mutex<Mirror>,
    in_flight: AtomicBool,
    closed: AtomicBool,
    min_interval: Duration,
    runs: AtomicU64,
}

impl DerivedValueProcessor {
    pub(crate) fn new(
        owner: EntityId,
        key: impl Into<String>,
        derivation: Box<dyn Derivation>,
        min_interval: Duration,
    ) -> Self {
        Self {
            owner,
            key: key.into(),
            derivation,
            mirror: Mutex::new(Mirror {
                dirty: true,
                ..Mirror::default()
            }),
            in_flight: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            min_interval,
            runs: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> EntityId {
        self.owner
    }

    /// Whether the mirrored value needs recomputing.
    pub fn is_dirty(&self) -> bool {
        lock(&self.mirror).dirty
    }

    /// Whether a recompute is queued or running.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wall-clock time of the last finished recompute.
    pub fn last_computed(&self) -> Option<DateTime<Utc>> {
        lock(&self.mirror).computed_utc
    }

    /// Number of recomputes executed so far.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Acquire)
    }

    /// Mirrored value, or the derivation's default when nothing is mirrored.
    /// Never blocks on a cache tier or on payload I/O.
    pub fn get_cached(&self, descriptor: Option<&PayloadDescriptor>) -> Option<CacheValue> {
        let mirrored = lock(&self.mirror).value.clone();
        mirrored.or_else(|| self.derivation.default_value(descriptor))
    }

    /// Load the mirror from a cache tier.
    pub(crate) fn hydrate(&self, cache: &dyn CacheStore) {
        let value = cache.get(self.owner, &self.key);
        let dirty = cache.is_dirty(self.owner, &self.key);
        // A miss is never clean, whatever flag the tier still holds.
        let dirty = dirty || value.is_none();
        let mut mirror = lock(&self.mirror);
        trace!(entity_id = %self.owner, key = %self.key, dirty, "processor mirror hydrated");
        mirror.value = value;
        mirror.dirty = dirty;
    }

    /// Mark the value dirty in the mirror and in `cache`.
    pub fn mark_dirty(&self, cache: Option<&dyn CacheStore>) {
        let mut mirror = lock(&self.mirror);
        mirror.generation += 1;
        mirror.dirty = true;
        if let Some(cache) = cache {
            cache.set_dirty(self.owner, &self.key, true);
        }
    }

    /// Schedule a recompute on `dispatch` if the value is dirty and none is
    /// in flight. Returns whether a recompute was scheduled.
    pub fn recompute_if_necessary(
        self: &Arc<Self>,
        entity: &Arc<DataEntity>,
        dispatch: &Arc<dyn Dispatch>,
    ) -> bool {
        if self.is_closed() {
            return false;
        }
        let delay = {
            let mirror = lock(&self.mirror);
            if !mirror.dirty {
                return false;
            }
            mirror
                .computed_at
                .map(|at| self.min_interval.saturating_sub(at.elapsed()))
                .unwrap_or(Duration::ZERO)
        };
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!(entity_id = %self.owner, key = %self.key, "recompute already in flight");
            return false;
        }

        debug!(
            entity_id = %self.owner,
            key = %self.key,
            delay_ms = delay.as_millis() as u64,
            "scheduling recompute"
        );

        let processor = Arc::clone(self);
        let entity = Arc::downgrade(entity);
        let next = Arc::clone(dispatch);
        dispatch.dispatch_after(delay, Box::new(move || processor.run(entity, next)));
        true
    }

    fn run(self: Arc<Self>, entity: Weak<DataEntity>, dispatch: Arc<dyn Dispatch>) {
        let guard = InFlightGuard(&self.in_flight);
        let Some(entity) = entity.upgrade() else {
            debug!(entity_id = %self.owner, key = %self.key, "owner dropped before recompute");
            return;
        };
        let outcome = self.compute_and_store(&entity);
        drop(guard);

        let Some(outcome) = outcome else {
            return;
        };
        self.announce(&entity, outcome.timestamp);

        // Covers dirtying both during the compute and after the mirror was
        // stored but before the in-flight flag dropped.
        if lock(&self.mirror).generation != outcome.generation {
            self.recompute_if_necessary(&entity, &dispatch);
        }
    }

    /// Recompute synchronously while holding a lease on `entity`.
    pub fn recompute(&self, entity: &DataEntity) {
        if let Some(outcome) = self.compute_and_store(entity) {
            self.announce(entity, outcome.timestamp);
        }
    }

    fn announce(&self, entity: &DataEntity, timestamp: DateTime<Utc>) {
        entity.publish(EntityEvent::ProcessorUpdated {
            entity_id: self.owner,
            key: self.key.clone(),
            timestamp,
        });
    }

    /// Compute and store the value. `None` when the processor is closed.
    fn compute_and_store(&self, entity: &DataEntity) -> Option<Outcome> {
        if self.is_closed() {
            return None;
        }
        let generation = lock(&self.mirror).generation;

        let computed = match entity.lease() {
            Ok(lease) => lease.payload().and_then(|payload| {
                match self.derivation.compute(&payload) {
                    Ok(value) => Some(value),
                    Err(reason) => {
                        error!(
                            entity_id = %self.owner,
                            key = %self.key,
                            error = %reason,
                            "derived value computation failed, using default"
                        );
                        None
                    }
                }
            }),
            Err(e) => {
                warn!(
                    entity_id = %self.owner,
                    key = %self.key,
                    error = %e,
                    "payload unavailable for recompute, using default"
                );
                None
            }
        };
        let value =
            computed.or_else(|| self.derivation.default_value(entity.descriptor().as_ref()));

        let cache = entity.cache();
        let timestamp = Utc::now();
        let dirtied = {
            let mut mirror = lock(&self.mirror);
            let dirtied = mirror.generation != generation;
            match value {
                Some(value) => {
                    if let Some(cache) = &cache {
                        cache.set(self.owner, &self.key, value.clone(), dirtied);
                    }
                    mirror.value = Some(value);
                    mirror.dirty = dirtied;
                }
                None => {
                    if let Some(cache) = &cache {
                        cache.remove(self.owner, &self.key);
                    }
                    mirror.value = None;
                    mirror.dirty = true;
                }
            }
            mirror.computed_at = Some(Instant::now());
            mirror.computed_utc = Some(timestamp);
            dirtied
        };

        self.runs.fetch_add(1, Ordering::AcqRel);
        debug!(entity_id = %self.owner, key = %self.key, dirtied, "recompute finished");
        Some(Outcome {
            generation,
            timestamp,
        })
    }

    /// Stop scheduling and executing recomputes.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(entity_id = %self.owner, key = %self.key, "processor closed");
        }
    }
}

impl std::fmt::Debug for DerivedValueProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedValueProcessor")
            .field("owner", &self.owner)
            .field("key", &self.key)
            .field("dirty", &self.is_dirty())
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}

/// Result of one finished recompute.
struct Outcome {
    /// Mirror generation observed when the compute started.
    generation: u64,
    timestamp: DateTime<Utc>,
}

/// Clears the in-flight flag on every exit path, including panics.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::{ElementCount, FnDerivation, RangeDerivation};
    use crate::dispatch::Job;
    use crate::payload::{MemoryPayloadStore, Payload};
    use crate::{EngineConfig, EntityRegistry};
    use serde_json::json;
    use std::sync::OnceLock;
    use tiercache_store::MemoryCache;

    /// Records jobs and their delays; tests run them by hand.
    #[derive(Default)]
    struct ManualDispatch {
        jobs: Mutex<Vec<(Duration, Job)>>,
    }

    impl ManualDispatch {
        fn pending(&self) -> usize {
            self.jobs.lock().unwrap().len()
        }

        fn delays(&self) -> Vec<Duration> {
            self.jobs.lock().unwrap().iter().map(|(d, _)| *d).collect()
        }

        fn run_all(&self) -> usize {
            let jobs: Vec<_> = self.jobs.lock().unwrap().drain(..).collect();
            let n = jobs.len();
            for (_, job) in jobs {
                job();
            }
            n
        }
    }

    impl Dispatch for ManualDispatch {
        fn dispatch_after(&self, delay: Duration, job: Job) {
            self.jobs.lock().unwrap().push((delay, job));
        }
    }

    /// A tier that lost its values but still reports them clean.
    struct CleanMisses;

    impl CacheStore for CleanMisses {
        fn set(&self, _: EntityId, _: &str, _: CacheValue, _: bool) {}
        fn get(&self, _: EntityId, _: &str) -> Option<CacheValue> {
            None
        }
        fn remove(&self, _: EntityId, _: &str) {}
        fn is_dirty(&self, _: EntityId, _: &str) -> bool {
            false
        }
        fn set_dirty(&self, _: EntityId, _: &str, _: bool) {}
        fn purge(&self, _: EntityId) {}
    }

    fn registry() -> (EntityRegistry, Arc<MemoryPayloadStore>, Arc<MemoryCache>) {
        let payloads = Arc::new(MemoryPayloadStore::new());
        let cache = Arc::new(MemoryCache::new());
        let registry = EntityRegistry::new(EngineConfig::default())
            .with_payload_store(payloads.clone());
        registry.attach_cache(cache.clone());
        (registry, payloads, cache)
    }

    #[test]
    fn new_processor_is_dirty_and_uses_default() {
        let (registry, _, _) = registry();
        let entity = registry.create(Some(crate::PayloadDescriptor::vector(7)));
        let count = entity.add_processor("count", ElementCount);

        assert!(count.is_dirty());
        assert!(!count.is_in_flight());
        assert_eq!(count.get_cached(entity.descriptor().as_ref()), Some(json!(7)));
        assert!(count.last_computed().is_none());
    }

    #[test]
    fn recompute_writes_clean_value_through_cache() {
        let (registry, payloads, cache) = registry();
        let entity = registry.create(None);
        payloads.insert(entity.id(), Payload::from_values(vec![1.0, 5.0, -2.0]));
        let range = entity.add_processor("range", RangeDerivation);

        range.recompute(&entity);

        assert!(!range.is_dirty());
        assert_eq!(range.runs(), 1);
        assert!(range.last_computed().is_some());
        assert_eq!(cache.get(entity.id(), "range"), Some(json!({"min": -2.0, "max": 5.0})));
        assert!(!cache.is_dirty(entity.id(), "range"));
        // The lease was released again.
        assert_eq!(entity.reference_count(), 0);
        assert!(!entity.is_loaded());
    }

    #[test]
    fn failed_compute_falls_back_to_default() {
        let (registry, payloads, cache) = registry();
        let entity = registry.create(None);
        payloads.insert(entity.id(), Payload::from_values(vec![1.0]));
        let broken = entity.add_processor(
            "broken",
            FnDerivation::new(|_: &Payload| Err("boom".to_string())).with_default(json!(-1)),
        );

        broken.recompute(&entity);

        assert!(!broken.is_dirty());
        assert_eq!(cache.get(entity.id(), "broken"), Some(json!(-1)));
    }

    #[test]
    fn no_payload_and_no_default_removes_record() {
        let (registry, _, cache) = registry();
        let entity = registry.create(None);
        cache.set(entity.id(), "range", json!("stale"), false);
        let range = entity.add_processor("range", RangeDerivation);
        assert!(!range.is_dirty());

        range.mark_dirty(entity.cache().as_deref());
        range.recompute(&entity);

        assert!(range.is_dirty());
        assert_eq!(range.get_cached(None), None);
        assert_eq!(cache.get(entity.id(), "range"), None);
    }

    #[test]
    fn single_flight_until_job_runs() {
        let (registry, payloads, _) = registry();
        let entity = registry.create(None);
        payloads.insert(entity.id(), Payload::from_values(vec![3.0]));
        let range = entity.add_processor("range", RangeDerivation);

        let manual = Arc::new(ManualDispatch::default());
        let dispatch: Arc<dyn Dispatch> = manual.clone();

        assert!(range.recompute_if_necessary(&entity, &dispatch));
        assert!(range.is_in_flight());
        assert!(!range.recompute_if_necessary(&entity, &dispatch));
        assert_eq!(manual.pending(), 1);

        assert_eq!(manual.run_all(), 1);
        assert!(!range.is_in_flight());
        assert!(!range.is_dirty());
        assert_eq!(range.runs(), 1);

        // Clean: nothing to do.
        assert!(!range.recompute_if_necessary(&entity, &dispatch));
    }

    #[test]
    fn recompute_is_delayed_by_min_interval() {
        let (registry, payloads, _) = registry();
        let entity = registry.create(None);
        payloads.insert(entity.id(), Payload::from_values(vec![3.0]));
        let range = entity.add_processor("range", RangeDerivation);

        let manual = Arc::new(ManualDispatch::default());
        let dispatch: Arc<dyn Dispatch> = manual.clone();

        range.recompute_if_necessary(&entity, &dispatch);
        assert_eq!(manual.delays(), vec![Duration::ZERO]);
        manual.run_all();

        range.mark_dirty(None);
        range.recompute_if_necessary(&entity, &dispatch);
        let delays = manual.delays();
        assert_eq!(delays.len(), 1);
        assert!(delays[0] > Duration::from_millis(400));
        assert!(delays[0] <= Duration::from_millis(500));
    }

    #[test]
    fn dirtied_before_job_starts_is_covered_by_it() {
        let (registry, payloads, cache) = registry();
        let entity = registry.create(None);
        payloads.insert(entity.id(), Payload::from_values(vec![3.0]));
        let range = entity.add_processor("range", RangeDerivation);

        let manual = Arc::new(ManualDispatch::default());
        let dispatch: Arc<dyn Dispatch> = manual.clone();

        range.recompute_if_necessary(&entity, &dispatch);
        // Dirtied after scheduling, before the job ran.
        range.mark_dirty(entity.cache().as_deref());
        assert!(!range.recompute_if_necessary(&entity, &dispatch));
        manual.run_all();

        assert!(!range.is_dirty());
        assert!(!cache.is_dirty(entity.id(), "range"));
        assert_eq!(manual.pending(), 0);
        assert_eq!(range.runs(), 1);
    }

    #[test]
    fn closed_processor_does_nothing() {
        let (registry, payloads, _) = registry();
        let entity = registry.create(None);
        payloads.insert(entity.id(), Payload::from_values(vec![3.0]));
        let range = entity.add_processor("range", RangeDerivation);
        let dispatch: Arc<dyn Dispatch> = Arc::new(ManualDispatch::default());

        range.close();
        assert!(!range.recompute_if_necessary(&entity, &dispatch));
        range.recompute(&entity);
        assert_eq!(range.runs(), 0);
    }

    #[test]
    fn dropped_owner_skips_job() {
        let (registry, payloads, _) = registry();
        let entity = registry.create(None);
        payloads.insert(entity.id(), Payload::from_values(vec![3.0]));
        let range = entity.add_processor("range", RangeDerivation);

        let manual = Arc::new(ManualDispatch::default());
        let dispatch: Arc<dyn Dispatch> = manual.clone();
        range.recompute_if_necessary(&entity, &dispatch);

        registry.remove(entity.id()).unwrap();
        drop(entity);
        manual.run_all();

        assert_eq!(range.runs(), 0);
        assert!(!range.is_in_flight());
    }

    #[test]
    fn hydrated_miss_is_dirty() {
        let (registry, payloads, _) = registry();
        let entity = registry.create(None);
        payloads.insert(entity.id(), Payload::from_values(vec![1.0]));
        let range = entity.add_processor("range", RangeDerivation);
        range.recompute(&entity);
        assert!(!range.is_dirty());

        range.hydrate(&CleanMisses);
        assert!(range.is_dirty());
        assert_eq!(range.get_cached(None), None);

        let dispatch: Arc<dyn Dispatch> = Arc::new(ManualDispatch::default());
        assert!(range.recompute_if_necessary(&entity, &dispatch));
    }

    #[test]
    fn trigger_swallowed_in_flight_runs_again() {
        type Hook = (Weak<DerivedValueProcessor>, Weak<DataEntity>, Arc<dyn Dispatch>);

        let (registry, payloads, _) = registry();
        let entity = registry.create(None);
        payloads.insert(entity.id(), Payload::from_values(vec![3.0, 4.0]));

        let manual = Arc::new(ManualDispatch::default());
        let dispatch: Arc<dyn Dispatch> = manual.clone();
        let hook: Arc<OnceLock<Hook>> = Arc::new(OnceLock::new());
        let triggered = Arc::new(AtomicBool::new(false));

        let derivation = {
            let hook = Arc::clone(&hook);
            let triggered = Arc::clone(&triggered);
            FnDerivation::new(move |payload: &Payload| {
                if !triggered.swap(true, Ordering::AcqRel) {
                    if let Some((processor, owner, dispatch)) = hook.get() {
                        if let (Some(processor), Some(owner)) = (processor.upgrade(), owner.upgrade()) {
                            processor.mark_dirty(None);
                            // The running job still holds the in-flight flag.
                            assert!(!processor.recompute_if_necessary(&owner, dispatch));
                        }
                    }
                }
                Ok(json!(payload.values().len()))
            })
        };
        let count = entity.add_processor("count", derivation);
        let _ = hook.set((
            Arc::downgrade(&count),
            Arc::downgrade(&entity),
            Arc::clone(&dispatch),
        ));

        assert!(count.recompute_if_necessary(&entity, &dispatch));
        assert_eq!(manual.run_all(), 1);
        assert!(triggered.load(Ordering::Acquire));
        assert!(count.is_dirty());
        assert!(count.is_in_flight());
        assert_eq!(manual.pending(), 1);

        manual.run_all();
        assert!(!count.is_dirty());
        assert!(!count.is_in_flight());
        assert_eq!(count.runs(), 2);
        assert_eq!(count.get_cached(None), Some(json!(2)));
    }
}
