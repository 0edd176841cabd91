//! tiercache engine.
//!
//! Lifecycle and invalidation for data-bearing entities:
//!
//! - **[`entity`]** -- [`DataEntity`]: reference-counted lazy load/unload of
//!   a bulk payload, reentrant transactions and live counts, staleness and
//!   batched change notifications.
//! - **[`processor`]** -- [`DerivedValueProcessor`]: one cached derived
//!   value per entity with a debounced, single-flight recompute.
//! - **[`registry`]** -- [`EntityRegistry`]: entity arena, dependency edges
//!   and the shared cache stack, backed by [`DashMap`](dashmap::DashMap).
//! - **[`derive`]** -- built-in [`Derivation`]s.
//! - **[`dispatch`]** -- where recomputes run ([`RuntimeDispatch`] on tokio,
//!   [`ThreadDispatch`] on plain threads).
//! - **[`events`]** -- notification bus backed by
//!   [`tokio::sync::broadcast`].
//! - **[`payload`]** -- payloads and the [`PayloadStore`] contract.
//! - **[`config`]** -- [`EngineConfig`].
//! - **[`error`]** -- engine error types via [`thiserror`].
//!
//! All public types are `Send + Sync`. Cache tiers come from
//! [`tiercache_store`].

pub mod config;
pub mod derive;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod events;
pub mod payload;
pub mod processor;
pub mod registry;
mod sync;

// Re-export the most commonly used types at the crate root for convenience.
pub use config::EngineConfig;
pub use derive::{Derivation, ElementCount, FnDerivation, RangeDerivation, StatsDerivation};
pub use dispatch::{Dispatch, Job, RuntimeDispatch, ThreadDispatch};
pub use entity::{ChangeScope, DataEntity, PayloadLease};
pub use error::{EngineError, Result};
pub use events::{ChangeKind, ChangeSet, EntityEvent, EventBus};
pub use payload::{MemoryPayloadStore, Payload, PayloadDescriptor, PayloadStore, ValueRange};
pub use processor::DerivedValueProcessor;
pub use registry::{DependencyHandle, EntityRegistry};
