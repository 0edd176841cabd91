//! Subcommand implementations.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tiercache_engine::{
    Dispatch, ElementCount, EngineConfig, EntityRegistry, MemoryPayloadStore, Payload,
    PayloadDescriptor, RangeDerivation, RuntimeDispatch, StatsDerivation,
};
use tiercache_store::{CacheStore, DurableCache, StoredRecord};
use tracing::info;
use uuid::Uuid;

use crate::helpers::{open_existing, preview};

// ---------------------------------------------------------------------------
// Subcommand: stats
// ---------------------------------------------------------------------------

pub fn cmd_stats(db: &Path, json: bool) -> Result<()> {
    let cache = open_existing(db)?;
    let stats = cache.stats().context("failed to read cache statistics")?;
    cache.close();

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("  Database: {}", db.display());
        println!("  Records:  {}", stats.records);
        println!("  Dirty:    {}", stats.dirty);
        println!("  Entities: {}", stats.targets);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: dump
// ---------------------------------------------------------------------------

pub fn cmd_dump(db: &Path, id: Option<Uuid>, json: bool) -> Result<()> {
    let cache = open_existing(db)?;
    let targets = match id {
        Some(id) => vec![id],
        None => cache.targets().context("failed to list entities")?,
    };

    for target in targets {
        let records = cache
            .records(target)
            .with_context(|| format!("failed to read records of {target}"))?;
        if json {
            for record in &records {
                print_json_line(target, record)?;
            }
        } else {
            print_records(target, &records);
        }
    }
    cache.close();
    Ok(())
}

fn print_json_line(target: Uuid, record: &StoredRecord) -> Result<()> {
    let line = serde_json::json!({
        "id": target,
        "key": record.key,
        "value": record.value,
        "dirty": record.dirty,
        "updated_at": record.updated_at,
    });
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

fn print_records(target: Uuid, records: &[StoredRecord]) {
    if records.is_empty() {
        println!("{target}: no records");
        return;
    }
    println!("{target}:");
    for record in records {
        let state = if record.dirty { "dirty" } else { "clean" };
        println!(
            "  {:<16} {:<5} {}  {}",
            record.key,
            state,
            record.updated_at.format("%Y-%m-%d %H:%M:%S"),
            preview(&record.value, 60)
        );
    }
}

// ---------------------------------------------------------------------------
// Subcommand: purge
// ---------------------------------------------------------------------------

pub fn cmd_purge(db: &Path, id: Uuid) -> Result<()> {
    let cache = open_existing(db)?;
    let removed = cache
        .records(id)
        .with_context(|| format!("failed to read records of {id}"))?
        .len();
    cache.purge(id);
    cache.close();

    info!(entity_id = %id, removed, "entity purged");
    println!("Removed {removed} record(s) of {id}.");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: demo
// ---------------------------------------------------------------------------

pub async fn cmd_demo(
    db: &Path,
    entities: usize,
    values: usize,
    config: Option<&Path>,
) -> Result<()> {
    let config = match config {
        Some(path) => EngineConfig::load(path).context("failed to load engine config")?,
        None => EngineConfig::default(),
    }
    .with_cache_path(db);

    let payloads = Arc::new(MemoryPayloadStore::new());
    let registry = EntityRegistry::new(config).with_payload_store(payloads.clone());
    registry
        .open_configured_cache()
        .context("failed to open cache")?;
    let dispatch: Arc<dyn Dispatch> =
        Arc::new(RuntimeDispatch::current().context("no tokio runtime")?);

    let mut processors = Vec::with_capacity(entities * 3);
    for i in 0..entities {
        let entity = registry.create(Some(PayloadDescriptor::vector(values)));
        let data = (0..values)
            .map(|j| ((i * values + j) as f64 * 0.01).sin() * (i + 1) as f64)
            .collect();
        payloads.insert(entity.id(), Payload::from_values(data));
        processors.push(entity.add_processor("range", RangeDerivation));
        processors.push(entity.add_processor("stats", StatsDerivation));
        processors.push(entity.add_processor("count", ElementCount));
    }

    let started = Instant::now();
    let scheduled = registry.recompute_stale(&dispatch);
    info!(scheduled, "recomputes scheduled");

    let deadline = started + Duration::from_secs(30);
    while processors.iter().any(|p| p.is_in_flight() || p.runs() == 0) {
        if Instant::now() > deadline {
            bail!("recomputes did not finish within 30s");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let elapsed = started.elapsed();

    let stats = registry
        .durable()
        .map(|durable: Arc<DurableCache>| durable.stats())
        .transpose()
        .context("failed to read cache statistics")?;
    registry.close();

    println!(
        "  Computed {} derived value(s) for {} entities in {:.1?}",
        processors.len(),
        entities,
        elapsed
    );
    println!("  Payload loads: {}", payloads.loads());
    if let Some(stats) = stats {
        println!("  Records in {}: {}", db.display(), stats.records);
    }
    Ok(())
}
