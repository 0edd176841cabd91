//! Asynchronous durable tier backed by SQLite.
//!
//! Every call on [`DurableCache`] becomes a unit of work on a
//! multi-producer, single-consumer [`crossbeam::channel`]. One dedicated
//! worker thread owns the [`Connection`] and drains the queue serially:
//!
//! ```text
//!  caller threads ──set/remove──▶ ┌──────────────┐
//!                 ──get + reply─▶ │ unbounded    │──▶ worker ──▶ cache_records
//!                 ◀──── reply ─── │ FIFO queue   │
//!                                 └──────────────┘
//! ```
//!
//! - Writes are fire-and-forget. With one worker and one queue, units run
//!   in submission order, so a read always observes every write submitted
//!   before it.
//! - Reads carry a one-shot reply channel and block the caller until the
//!   worker answers. Other callers keep enqueueing meanwhile.
//! - [`spill`](CacheStore::spill) is a barrier: it returns once every unit
//!   submitted before it has been committed.
//! - [`DurableCache::close`] enqueues a terminal sentinel, lets the worker
//!   drain everything ahead of it, and joins the thread.
//!
//! A unit that fails (SQLite error, bad blob, or even a panic) is logged and
//! skipped. The worker keeps running and a read that hit the failure gets
//! the default answer.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, TimeZone, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::db;
use crate::error::{StoreError, StoreResult};
use crate::tier::{CacheOp, CacheStore, CacheValue, EntityId};

/// Aggregate counts over the durable table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DurableStats {
    pub records: u64,
    pub dirty: u64,
    pub targets: u64,
}

/// One row of the durable table, as returned by [`DurableCache::records`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub key: String,
    pub value: CacheValue,
    pub dirty: bool,
    pub updated_at: DateTime<Utc>,
}

/// A unit of work for the worker thread.
enum Work {
    Apply(CacheOp),
    Get {
        target: EntityId,
        key: String,
        reply: Sender<Option<CacheValue>>,
    },
    IsDirty {
        target: EntityId,
        key: String,
        reply: Sender<bool>,
    },
    Flush {
        reply: Sender<()>,
    },
    Stats {
        reply: Sender<StoreResult<DurableStats>>,
    },
    Records {
        target: EntityId,
        reply: Sender<StoreResult<Vec<StoredRecord>>>,
    },
    Targets {
        reply: Sender<StoreResult<Vec<EntityId>>>,
    },
    Shutdown,
}

impl Work {
    fn name(&self) -> &'static str {
        match self {
            Self::Apply(op) => op.name(),
            Self::Get { .. } => "get",
            Self::IsDirty { .. } => "is_dirty",
            Self::Flush { .. } => "flush",
            Self::Stats { .. } => "stats",
            Self::Records { .. } => "records",
            Self::Targets { .. } => "targets",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A [`CacheStore`] persisting to SQLite through a single worker thread.
pub struct DurableCache {
    label: String,
    sender: Sender<Work>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DurableCache {
    /// Open (or create) the cache database at `path` and start the worker.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = db::open_connection(path)?;
        Self::start(conn, path.display().to_string())
    }

    /// Start a worker over a private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = db::open_in_memory()?;
        Self::start(conn, ":memory:".to_string())
    }

    fn start(conn: Connection, label: String) -> StoreResult<Self> {
        let (sender, receiver) = channel::unbounded();
        let worker_label = label.clone();
        let handle = thread::Builder::new()
            .name("tiercache-durable".to_string())
            .spawn(move || worker_loop(conn, receiver, &worker_label))
            .map_err(|e| StoreError::Worker(format!("failed to spawn worker: {e}")))?;

        info!(db = %label, "durable cache opened");
        Ok(Self {
            label,
            sender,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Number of units waiting in the queue.
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    /// Whether [`close`](Self::close) has completed.
    pub fn is_closed(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Drain the queue and stop the worker.
    ///
    /// Every unit submitted before this call is applied before it returns.
    /// Calling `close` twice is harmless.
    pub fn close(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };

        let pending = self.sender.len();
        if self.sender.send(Work::Shutdown).is_err() {
            warn!(db = %self.label, "durable worker exited before shutdown sentinel");
        }
        if handle.join().is_err() {
            error!(db = %self.label, "durable worker thread panicked");
        }
        info!(db = %self.label, drained = pending, "durable cache closed");
    }

    /// Counts over the whole table.
    pub fn stats(&self) -> StoreResult<DurableStats> {
        self.request(|reply| Work::Stats { reply })
            .ok_or(StoreError::Closed)?
    }

    /// Every record stored for `target`, ordered by key.
    pub fn records(&self, target: EntityId) -> StoreResult<Vec<StoredRecord>> {
        self.request(|reply| Work::Records { target, reply })
            .ok_or(StoreError::Closed)?
    }

    /// Distinct targets that have at least one record.
    pub fn targets(&self) -> StoreResult<Vec<EntityId>> {
        self.request(|reply| Work::Targets { reply })
            .ok_or(StoreError::Closed)?
    }

    fn submit(&self, op: CacheOp) {
        trace!(db = %self.label, op = op.name(), target_id = %op.target(), "durable cache enqueue");
        if let Err(err) = self.sender.send(Work::Apply(op)) {
            warn!(
                db = %self.label,
                op = err.0.name(),
                "durable cache is closed, dropping write"
            );
        }
    }

    /// Enqueue a unit carrying a reply channel and block for the answer.
    ///
    /// `None` means the worker is gone or dropped the reply after a failure.
    fn request<T>(&self, make: impl FnOnce(Sender<T>) -> Work) -> Option<T> {
        let (reply, answer) = channel::bounded(1);
        if self.sender.send(make(reply)).is_err() {
            warn!(db = %self.label, "durable cache is closed, answering with default");
            return None;
        }
        answer.recv().ok()
    }
}

impl Drop for DurableCache {
    fn drop(&mut self) {
        self.close();
    }
}

impl CacheStore for DurableCache {
    fn set(&self, target: EntityId, key: &str, value: CacheValue, dirty: bool) {
        self.submit(CacheOp::Set {
            target,
            key: key.to_string(),
            value,
            dirty,
        });
    }

    fn get(&self, target: EntityId, key: &str) -> Option<CacheValue> {
        self.request(|reply| Work::Get {
            target,
            key: key.to_string(),
            reply,
        })
        .flatten()
    }

    fn remove(&self, target: EntityId, key: &str) {
        self.submit(CacheOp::Remove {
            target,
            key: key.to_string(),
        });
    }

    fn is_dirty(&self, target: EntityId, key: &str) -> bool {
        self.request(|reply| Work::IsDirty {
            target,
            key: key.to_string(),
            reply,
        })
        .unwrap_or(true)
    }

    fn set_dirty(&self, target: EntityId, key: &str, dirty: bool) {
        self.submit(CacheOp::SetDirty {
            target,
            key: key.to_string(),
            dirty,
        });
    }

    fn purge(&self, target: EntityId) {
        self.submit(CacheOp::Purge { target });
    }

    fn spill(&self) {
        if self.request(|reply| Work::Flush { reply }).is_none() {
            warn!(db = %self.label, "durable cache flush did not complete");
        }
    }
}

// ── worker ───────────────────────────────────────────────────────────

fn worker_loop(conn: Connection, receiver: Receiver<Work>, label: &str) {
    debug!(db = %label, "durable worker started");
    let mut executed = 0u64;

    for work in receiver.iter() {
        if matches!(work, Work::Shutdown) {
            break;
        }
        let name = work.name();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| execute(&conn, work)));
        match outcome {
            Ok(Ok(())) => executed += 1,
            Ok(Err(err)) => {
                error!(db = %label, unit = name, %err, "durable cache unit failed");
            }
            Err(_) => {
                error!(db = %label, unit = name, "durable cache unit panicked");
            }
        }
    }

    debug!(db = %label, executed, "durable worker stopped");
}

/// Run one unit. Replies are sent even for failed reads so the caller never
/// waits on a unit that errored; a dropped reply sender also unblocks it.
fn execute(conn: &Connection, work: Work) -> StoreResult<()> {
    match work {
        Work::Apply(op) => apply(conn, op),
        Work::Get { target, key, reply } => {
            let result = read_value(conn, target, &key);
            let _ = reply.send(result.as_ref().ok().cloned().flatten());
            result.map(|_| ())
        }
        Work::IsDirty { target, key, reply } => {
            let result = read_dirty(conn, target, &key);
            let _ = reply.send(*result.as_ref().unwrap_or(&true));
            result.map(|_| ())
        }
        Work::Flush { reply } => {
            let _ = reply.send(());
            Ok(())
        }
        Work::Stats { reply } => {
            let _ = reply.send(read_stats(conn));
            Ok(())
        }
        Work::Records { target, reply } => {
            let _ = reply.send(read_records(conn, target));
            Ok(())
        }
        Work::Targets { reply } => {
            let _ = reply.send(read_targets(conn));
            Ok(())
        }
        Work::Shutdown => Ok(()),
    }
}

fn apply(conn: &Connection, op: CacheOp) -> StoreResult<()> {
    match op {
        CacheOp::Set {
            target,
            key,
            value,
            dirty,
        } => {
            let blob = serde_json::to_vec(&value)?;
            conn.execute(
                "INSERT INTO cache_records (id, key, value, dirty, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id, key) DO UPDATE SET
                     value = excluded.value,
                     dirty = excluded.dirty,
                     updated_at = excluded.updated_at",
                params![
                    target.to_string(),
                    key,
                    blob,
                    dirty,
                    Utc::now().timestamp_millis()
                ],
            )?;
        }
        CacheOp::Remove { target, key } => {
            conn.execute(
                "DELETE FROM cache_records WHERE id = ?1 AND key = ?2",
                params![target.to_string(), key],
            )?;
        }
        CacheOp::SetDirty { target, key, dirty } => {
            conn.execute(
                "UPDATE cache_records SET dirty = ?3, updated_at = ?4 WHERE id = ?1 AND key = ?2",
                params![
                    target.to_string(),
                    key,
                    dirty,
                    Utc::now().timestamp_millis()
                ],
            )?;
        }
        CacheOp::Purge { target } => {
            let removed = conn.execute(
                "DELETE FROM cache_records WHERE id = ?1",
                params![target.to_string()],
            )?;
            debug!(target_id = %target, removed, "durable cache purged target");
        }
    }
    Ok(())
}

fn read_value(conn: &Connection, target: EntityId, key: &str) -> StoreResult<Option<CacheValue>> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            "SELECT value FROM cache_records WHERE id = ?1 AND key = ?2",
            params![target.to_string(), key],
            |row| row.get(0),
        )
        .optional()?;
    match blob {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// A record whose value no longer decodes reads as dirty, like a missing one.
fn read_dirty(conn: &Connection, target: EntityId, key: &str) -> StoreResult<bool> {
    let row: Option<(bool, Vec<u8>)> = conn
        .query_row(
            "SELECT dirty, value FROM cache_records WHERE id = ?1 AND key = ?2",
            params![target.to_string(), key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(match row {
        Some((dirty, blob)) => dirty || serde_json::from_slice::<CacheValue>(&blob).is_err(),
        None => true,
    })
}

fn read_stats(conn: &Connection) -> StoreResult<DurableStats> {
    let stats = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(dirty), 0), COUNT(DISTINCT id) FROM cache_records",
        [],
        |row| {
            Ok(DurableStats {
                records: row.get::<_, i64>(0)? as u64,
                dirty: row.get::<_, i64>(1)? as u64,
                targets: row.get::<_, i64>(2)? as u64,
            })
        },
    )?;
    Ok(stats)
}

fn read_records(conn: &Connection, target: EntityId) -> StoreResult<Vec<StoredRecord>> {
    let mut stmt = conn.prepare(
        "SELECT key, value, dirty, updated_at FROM cache_records WHERE id = ?1 ORDER BY key",
    )?;
    let rows = stmt.query_map(params![target.to_string()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, bool>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (key, blob, dirty, updated_ms) = row?;
        records.push(StoredRecord {
            key,
            value: serde_json::from_slice(&blob)?,
            dirty,
            updated_at: Utc
                .timestamp_millis_opt(updated_ms)
                .single()
                .unwrap_or_default(),
        });
    }
    Ok(records)
}

fn read_targets(conn: &Connection) -> StoreResult<Vec<EntityId>> {
    let mut stmt = conn.prepare("SELECT DISTINCT id FROM cache_records ORDER BY id")?;
    let ids = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut targets = Vec::new();
    for id in ids {
        let id = id?;
        let parsed = Uuid::parse_str(&id).map_err(|e| StoreError::InvalidTarget {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        targets.push(parsed);
    }
    Ok(targets)
}

// ── tests ────────────────────────────────────────────────────────────
