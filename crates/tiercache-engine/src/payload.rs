//! Bulk payloads and the store that loads them.
//!
//! A [`Payload`] is a numeric array plus its [`PayloadDescriptor`]. The
//! engine treats the on-disk layout as somebody else's problem: it only
//! talks to a [`PayloadStore`].

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tiercache_store::EntityId;
use tracing::trace;

use crate::error::{EngineError, Result};

/// Shape of a payload, known even while the payload itself is unloaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadDescriptor {
    pub shape: Vec<usize>,
}

impl PayloadDescriptor {
    pub fn new(shape: impl Into<Vec<usize>>) -> Self {
        Self {
            shape: shape.into(),
        }
    }

    /// One-dimensional descriptor of `len` elements.
    pub fn vector(len: usize) -> Self {
        Self { shape: vec![len] }
    }

    /// Number of elements the shape describes. A zero-dimensional shape is
    /// a scalar.
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Closed interval covering every finite value of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

/// A bulk numeric array owned by one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    descriptor: PayloadDescriptor,
    values: Vec<f64>,
}

impl Payload {
    /// Build a payload, checking that `values` matches the descriptor.
    pub fn new(descriptor: PayloadDescriptor, values: Vec<f64>) -> Result<Self> {
        let expected = descriptor.element_count();
        if expected != values.len() {
            return Err(EngineError::ShapeMismatch {
                expected,
                actual: values.len(),
            });
        }
        Ok(Self { descriptor, values })
    }

    /// One-dimensional payload.
    pub fn from_values(values: Vec<f64>) -> Self {
        Self {
            descriptor: PayloadDescriptor::vector(values.len()),
            values,
        }
    }

    pub fn descriptor(&self) -> &PayloadDescriptor {
        &self.descriptor
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Range of the finite values, or `None` if there are none.
    pub fn range(&self) -> Option<ValueRange> {
        self.values
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(None, |acc, v| match acc {
                None => Some(ValueRange { min: v, max: v }),
                Some(r) => Some(ValueRange {
                    min: r.min.min(v),
                    max: r.max.max(v),
                }),
            })
    }
}

// ---------------------------------------------------------------------------
// Payload store
// ---------------------------------------------------------------------------

/// Source of truth for bulk payloads.
///
/// `load` and `write` are on the authoritative path, so their errors reach
/// the caller. `unload` is a hint that the engine dropped its copy.
pub trait PayloadStore: Send + Sync {
    fn load(&self, id: EntityId) -> Result<Payload>;

    fn write(&self, id: EntityId, payload: &Payload) -> Result<()>;

    fn unload(&self, id: EntityId);
}

/// In-memory [`PayloadStore`] that counts calls.
#[derive(Debug, Default)]
pub struct MemoryPayloadStore {
    payloads: DashMap<EntityId, Payload>,
    loads: AtomicUsize,
    writes: AtomicUsize,
    unloads: AtomicUsize,
}

impl MemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store without counting a write.
    pub fn insert(&self, id: EntityId, payload: Payload) {
        self.payloads.insert(id, payload);
    }

    /// Stored copy of the payload for `id`.
    pub fn stored(&self, id: EntityId) -> Option<Payload> {
        self.payloads.get(&id).map(|p| p.value().clone())
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

impl PayloadStore for MemoryPayloadStore {
    fn load(&self, id: EntityId) -> Result<Payload> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        trace!(entity_id = %id, "memory payload store load");
        self.payloads
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or_else(|| EngineError::PayloadLoad {
                entity_id: id,
                reason: "no payload stored".into(),
            })
    }

    fn write(&self, id: EntityId, payload: &Payload) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        trace!(entity_id = %id, len = payload.len(), "memory payload store write");
        self.payloads.insert(id, payload.clone());
        Ok(())
    }

    fn unload(&self, id: EntityId) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        trace!(entity_id = %id, "memory payload store unload");
    }
}
