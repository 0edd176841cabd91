//! # tiercache-store
//!
//! Cache tiers for the tiercache engine.
//!
//! Every tier implements the same [`CacheStore`] contract, so tiers stack
//! by dependency injection instead of runtime probing:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  TracingCache     (pass-through, counters)  │
//! ├─────────────────────────────────────────────┤
//! │  PendingCache     (buffers until attached)  │
//! ├─────────────────────────────────────────────┤
//! │  SuspendingCache  (defers writes per txn)   │
//! ├─────────────────────────────────────────────┤
//! │  DurableCache     (SQLite, 1 worker thread) │
//! │  MemoryCache      (DashMap, no persistence) │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Missing records are always reported dirty.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tiercache_store::{CacheStore, DurableCache, SuspendingCache};
//!
//! let durable = Arc::new(DurableCache::open("cache.db")?);
//! let cache = SuspendingCache::new(durable.clone());
//! cache.suspend();
//! cache.set(id, "range", serde_json::json!([0.0, 1.0]), false);
//! cache.spill();
//! durable.close();
//! ```

pub mod db;
pub mod durable;
pub mod error;
pub mod memory;
pub mod migration;
pub mod pending;
pub mod suspend;
pub mod tier;
pub mod traced;

// ── re-exports ───────────────────────────────────────────────────────

pub use durable::{DurableCache, DurableStats, StoredRecord};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryCache;
pub use pending::PendingCache;
pub use suspend::SuspendingCache;
pub use tier::{CacheOp, CacheRecord, CacheStore, CacheValue, EntityId};
pub use traced::{CacheStats, TracingCache};
