//! Integration tests for the tiercache-engine crate.
//!
//! These tests exercise entities, processors, dispatchers and the durable
//! cache stack together.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tiercache_engine::{
    ChangeKind, Dispatch, EngineConfig, EntityEvent, EntityRegistry, MemoryPayloadStore, Payload,
    RangeDerivation, RuntimeDispatch, StatsDerivation, ThreadDispatch,
};
use tiercache_store::CacheStore;

fn registry_with(config: EngineConfig) -> (EntityRegistry, Arc<MemoryPayloadStore>) {
    let payloads = Arc::new(MemoryPayloadStore::new());
    let registry = EntityRegistry::new(config).with_payload_store(payloads.clone());
    (registry, payloads)
}

async fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}

// ═══════════════════════════════════════════════════════════════════════
//  Recompute scheduling
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_triggers_run_one_recompute() {
    let (registry, payloads) = registry_with(EngineConfig::default());
    registry.open_configured_cache().unwrap();
    let entity = registry.create(None);
    payloads.insert(entity.id(), Payload::from_values(vec![1.0, 9.0]));
    let range = entity.add_processor("range", RangeDerivation);

    let dispatch: Arc<dyn Dispatch> = Arc::new(RuntimeDispatch::current().unwrap());
    assert!(range.recompute_if_necessary(&entity, &dispatch));
    assert!(!range.recompute_if_necessary(&entity, &dispatch));

    assert!(wait_until(Duration::from_secs(5), || !range.is_in_flight() && range.runs() == 1).await);
    // A third trigger within the interval finds the value clean.
    assert!(!range.recompute_if_necessary(&entity, &dispatch));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(range.runs(), 1);
    assert_eq!(entity.cached_value("range"), Some(json!({"min": 1.0, "max": 9.0})));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consecutive_recomputes_respect_min_interval() {
    let config = EngineConfig::new().with_min_recompute_interval(Duration::from_millis(200));
    let (registry, payloads) = registry_with(config);
    let entity = registry.create(None);
    payloads.insert(entity.id(), Payload::from_values(vec![1.0]));
    let range = entity.add_processor("range", RangeDerivation);
    let dispatch: Arc<dyn Dispatch> = Arc::new(RuntimeDispatch::current().unwrap());

    range.recompute_if_necessary(&entity, &dispatch);
    assert!(wait_until(Duration::from_secs(5), || range.runs() == 1).await);
    let first = Instant::now();

    entity.mark_stale();
    assert!(range.recompute_if_necessary(&entity, &dispatch));
    assert!(wait_until(Duration::from_secs(5), || range.runs() == 2).await);
    assert!(first.elapsed() >= Duration::from_millis(150));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dependents_recompute_after_source_changes() {
    let config = EngineConfig::new().with_min_recompute_interval(Duration::from_millis(10));
    let (registry, payloads) = registry_with(config);
    let source = registry.create(None);
    let derived = registry.create(None);
    payloads.insert(derived.id(), Payload::from_values(vec![2.0, 4.0, 6.0]));
    let stats = derived.add_processor("stats", StatsDerivation);
    let edge = registry.add_dependent(source.id(), derived.id()).unwrap();

    let mut rx = registry.subscribe();
    source.set_payload(Payload::from_values(vec![0.0])).unwrap();
    assert!(derived.is_stale());
    assert!(stats.is_dirty());

    let dispatch: Arc<dyn Dispatch> = Arc::new(ThreadDispatch::new());
    assert_eq!(registry.recompute_stale(&dispatch), 1);

    let updated = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if let EntityEvent::ProcessorUpdated { entity_id, key, .. } = event.as_ref() {
                break (*entity_id, key.clone());
            }
        }
    })
    .await
    .expect("processor update should be published");

    assert_eq!(updated, (derived.id(), "stats".to_string()));
    assert_eq!(derived.cached_value("stats").unwrap()["mean"], json!(4.0));
    edge.release().unwrap();
}

// ═══════════════════════════════════════════════════════════════════════
//  Notifications
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn content_changed_is_batched_per_outermost_scope() {
    let (registry, _) = registry_with(EngineConfig::default());
    let entity = registry.create(None);
    let mut rx = registry.subscribe();

    {
        let _outer = entity.begin_change();
        {
            let inner = entity.begin_change();
            inner.note(ChangeKind::Metadata);
        }
        entity.set_payload(Payload::from_values(vec![3.0, 1.0])).unwrap();
    }

    let event = rx.recv().await.unwrap();
    match event.as_ref() {
        EntityEvent::ContentChanged { entity_id, changes } => {
            assert_eq!(*entity_id, entity.id());
            assert!(changes.contains(&ChangeKind::Metadata));
            assert!(changes.contains(&ChangeKind::Payload));
            assert!(changes.contains(&ChangeKind::Descriptor));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(rx.try_recv().is_err());
}

// ═══════════════════════════════════════════════════════════════════════
//  Durable cache stack
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn derived_values_survive_registry_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::new().with_cache_path(dir.path().join("cache.db"));
    let payloads = Arc::new(MemoryPayloadStore::new());

    let id = {
        let registry =
            EntityRegistry::new(config.clone()).with_payload_store(payloads.clone());
        assert!(registry.open_configured_cache().unwrap());
        let entity = registry.create(None);
        payloads.insert(entity.id(), Payload::from_values(vec![-4.0, 8.0]));
        let range = entity.add_processor("range", RangeDerivation);
        range.recompute(&entity);
        registry.close();
        entity.id()
    };
    let loads_before = payloads.loads();

    let registry = EntityRegistry::new(config).with_payload_store(payloads.clone());
    registry.open_configured_cache().unwrap();
    let entity = registry.create_with_id(id, None);
    let range = entity.add_processor("range", RangeDerivation);

    assert!(!range.is_dirty());
    assert_eq!(entity.cached_value("range"), Some(json!({"min": -4.0, "max": 8.0})));
    assert_eq!(payloads.loads(), loads_before);
    registry.close();
}

#[test]
fn transaction_defers_cache_writes_until_outermost_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::new()
        .with_cache_path(dir.path().join("cache.db"))
        .with_trace_cache(true);
    let (registry, payloads) = registry_with(config);
    registry.open_configured_cache().unwrap();
    let durable = registry.durable().expect("durable tier opened");

    let entity = registry.create(None);
    payloads.insert(entity.id(), Payload::from_values(vec![5.0]));
    let range = entity.add_processor("range", RangeDerivation);

    entity.begin_transaction(2);
    range.recompute(&entity);
    assert_eq!(durable.get(entity.id(), "range"), None);
    assert!(entity.is_loaded());

    entity.end_transaction(1).unwrap();
    assert_eq!(durable.get(entity.id(), "range"), None);

    entity.end_transaction(1).unwrap();
    assert_eq!(durable.get(entity.id(), "range"), Some(json!({"min": 5.0, "max": 5.0})));
    assert!(!durable.is_dirty(entity.id(), "range"));
    assert_eq!(entity.flush_count(), 1);
    assert_eq!(payloads.writes(), 1);
    assert!(!entity.is_loaded());

    registry.close();
    assert!(durable.is_closed());
}

#[test]
fn removing_entity_purges_durable_records() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::new().with_cache_path(dir.path().join("cache.db"));
    let (registry, payloads) = registry_with(config);
    registry.open_configured_cache().unwrap();
    let durable = registry.durable().unwrap();

    let keep = registry.create(None);
    let gone = registry.create(None);
    for entity in [&keep, &gone] {
        payloads.insert(entity.id(), Payload::from_values(vec![1.0, 2.0]));
        entity.add_processor("stats", StatsDerivation).recompute(entity);
    }
    assert_eq!(durable.stats().unwrap().targets, 2);

    registry.remove(gone.id()).unwrap();
    let targets = durable.targets().unwrap();
    assert_eq!(targets, vec![keep.id()]);
    registry.close();
}

#[test]
fn undecodable_record_is_recomputed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let id = uuid::Uuid::now_v7();
    {
        let conn = tiercache_store::db::open_connection(&path).unwrap();
        conn.execute(
            "INSERT INTO cache_records (id, key, value, dirty, updated_at) \
             VALUES (?1, 'range', x'ff00', 0, 0)",
            [id.to_string()],
        )
        .unwrap();
    }

    let (registry, payloads) = registry_with(EngineConfig::new().with_cache_path(&path));
    registry.open_configured_cache().unwrap();
    let entity = registry.create_with_id(id, None);
    payloads.insert(id, Payload::from_values(vec![2.0, 6.0]));
    let range = entity.add_processor("range", RangeDerivation);

    assert_eq!(range.get_cached(None), None);
    assert!(range.is_dirty());

    range.recompute(&entity);
    assert!(!range.is_dirty());
    let durable = registry.durable().unwrap();
    assert_eq!(durable.get(id, "range"), Some(json!({"min": 2.0, "max": 6.0})));
    registry.close();
}

#[test]
fn close_keeps_writes_of_open_transactions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let (registry, payloads) = registry_with(EngineConfig::new().with_cache_path(&path));
    registry.open_configured_cache().unwrap();

    let busy = registry.create(None);
    let follower = registry.create(None);
    let other = registry.create(None);
    let edge = registry.add_dependent(busy.id(), follower.id()).unwrap();
    payloads.insert(busy.id(), Payload::from_values(vec![1.0]));
    payloads.insert(other.id(), Payload::from_values(vec![-1.0, 1.0]));
    let busy_range = busy.add_processor("range", RangeDerivation);
    let other_range = other.add_processor("range", RangeDerivation);

    busy.begin_transaction(1);
    other_range.recompute(&other);
    busy_range.recompute(&busy);

    let durable = registry.durable().unwrap();
    // Unrelated entities are not held back by the open transaction.
    assert_eq!(durable.get(other.id(), "range"), Some(json!({"min": -1.0, "max": 1.0})));
    assert_eq!(durable.get(busy.id(), "range"), None);

    registry.close();
    assert!(durable.is_closed());

    let reopened = tiercache_store::DurableCache::open(&path).unwrap();
    assert_eq!(reopened.get(other.id(), "range"), Some(json!({"min": -1.0, "max": 1.0})));
    assert_eq!(reopened.get(busy.id(), "range"), Some(json!({"min": 1.0, "max": 1.0})));
    reopened.close();

    busy.end_transaction(1).unwrap();
    edge.release().unwrap();
}

#[test]
fn removing_source_mid_transaction_lets_dependent_flush() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, payloads) =
        registry_with(EngineConfig::new().with_cache_path(dir.path().join("cache.db")));
    registry.open_configured_cache().unwrap();
    let durable = registry.durable().unwrap();

    let source = registry.create(None);
    let dependent = registry.create(None);
    let edge = registry.add_dependent(source.id(), dependent.id()).unwrap();
    payloads.insert(dependent.id(), Payload::from_values(vec![4.0]));
    let range = dependent.add_processor("range", RangeDerivation);

    source.begin_transaction(1);
    range.recompute(&dependent);
    assert_eq!(durable.get(dependent.id(), "range"), None);

    registry.remove(source.id()).unwrap();
    edge.release().unwrap();

    assert_eq!(dependent.transaction_count(), 0);
    assert_eq!(dependent.flush_count(), 1);
    assert_eq!(durable.get(dependent.id(), "range"), Some(json!({"min": 4.0, "max": 4.0})));
    // The payload kept resident by the transaction was written and dropped.
    assert_eq!(payloads.writes(), 1);
    assert!(!dependent.is_loaded());
    registry.close();
}

// ═══════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn registry_from_toml_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.toml");
    std::fs::write(
        &path,
        "min_recompute_interval_ms = 25\nevent_capacity = 4\n",
    )
    .unwrap();

    let config = EngineConfig::load(&path).unwrap();
    let registry = EntityRegistry::new(config);
    assert_eq!(
        registry.config().min_recompute_interval(),
        Duration::from_millis(25)
    );
    assert_eq!(registry.bus().subscriber_count(), 0);
}
