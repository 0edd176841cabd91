//! The [`CacheStore`] contract shared by every tier.
//!
//! A cache record is addressed by `(target, key)` where `target` is the
//! stable id of the owning entity and `key` names one derived value. Each
//! record carries an opaque [`CacheValue`] and a dirty flag.
//!
//! Absence is never "clean": [`CacheStore::is_dirty`] reports `true` for a
//! key that has no record, so callers recompute instead of trusting a value
//! that was never written.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a cache target (one data entity).
pub type EntityId = Uuid;

/// Opaque value stored in a cache record.
pub type CacheValue = serde_json::Value;

/// A value plus its dirty flag, as held by the flat and buffering tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub value: CacheValue,
    pub dirty: bool,
}

impl CacheRecord {
    /// A clean record holding `value`.
    pub fn clean(value: CacheValue) -> Self {
        Self {
            value,
            dirty: false,
        }
    }
}

/// Read/write contract implemented by every cache tier.
///
/// Implementations are `Send + Sync` and take `&self`: each tier guards its
/// own state. No method returns an error; a tier that fails internally logs
/// the failure and answers as if the record were missing.
pub trait CacheStore: Send + Sync {
    /// Store `value` for `(target, key)` with the given dirty flag.
    fn set(&self, target: EntityId, key: &str, value: CacheValue, dirty: bool);

    /// Fetch the value for `(target, key)`, or `None` on a miss.
    fn get(&self, target: EntityId, key: &str) -> Option<CacheValue>;

    /// Remove the record for `(target, key)` if present.
    fn remove(&self, target: EntityId, key: &str);

    /// Whether the record is dirty. Missing records are dirty.
    fn is_dirty(&self, target: EntityId, key: &str) -> bool;

    /// Update the dirty flag of an existing record. No-op when absent.
    fn set_dirty(&self, target: EntityId, key: &str, dirty: bool);

    /// Remove every record belonging to `target`.
    fn purge(&self, target: EntityId);

    /// Start deferring writes. Tiers without buffering ignore this.
    fn suspend(&self) {}

    /// Push deferred writes to the backing store. Tiers without buffering
    /// ignore this.
    fn spill(&self) {}

    /// Fetch the value for `(target, key)`, falling back to `default`.
    fn get_or(&self, target: EntityId, key: &str, default: CacheValue) -> CacheValue {
        self.get(target, key).unwrap_or(default)
    }

    /// Mark a record dirty.
    fn invalidate(&self, target: EntityId, key: &str) {
        self.set_dirty(target, key, true);
    }
}

impl<T: CacheStore + ?Sized> CacheStore for Arc<T> {
    fn set(&self, target: EntityId, key: &str, value: CacheValue, dirty: bool) {
        (**self).set(target, key, value, dirty);
    }

    fn get(&self, target: EntityId, key: &str) -> Option<CacheValue> {
        (**self).get(target, key)
    }

    fn remove(&self, target: EntityId, key: &str) {
        (**self).remove(target, key);
    }

    fn is_dirty(&self, target: EntityId, key: &str) -> bool {
        (**self).is_dirty(target, key)
    }

    fn set_dirty(&self, target: EntityId, key: &str, dirty: bool) {
        (**self).set_dirty(target, key, dirty);
    }

    fn purge(&self, target: EntityId) {
        (**self).purge(target);
    }

    fn suspend(&self) {
        (**self).suspend();
    }

    fn spill(&self) {
        (**self).spill();
    }
}

/// One recorded mutation against a [`CacheStore`].
///
/// Buffering tiers keep these in submission order and replay them with
/// [`CacheOp::apply`]; the durable tier ships them to its worker thread.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOp {
    Set {
        target: EntityId,
        key: String,
        value: CacheValue,
        dirty: bool,
    },
    Remove {
        target: EntityId,
        key: String,
    },
    SetDirty {
        target: EntityId,
        key: String,
        dirty: bool,
    },
    Purge {
        target: EntityId,
    },
}

impl CacheOp {
    /// Replay this operation against `store`.
    pub fn apply(self, store: &dyn CacheStore) {
        match self {
            Self::Set {
                target,
                key,
                value,
                dirty,
            } => store.set(target, &key, value, dirty),
            Self::Remove { target, key } => store.remove(target, &key),
            Self::SetDirty { target, key, dirty } => store.set_dirty(target, &key, dirty),
            Self::Purge { target } => store.purge(target),
        }
    }

    /// The target this operation touches.
    pub fn target(&self) -> EntityId {
        match self {
            Self::Set { target, .. }
            | Self::Remove { target, .. }
            | Self::SetDirty { target, .. }
            | Self::Purge { target } => *target,
        }
    }

    /// Short operation name for log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Set { .. } => "set",
            Self::Remove { .. } => "remove",
            Self::SetDirty { .. } => "set_dirty",
            Self::Purge { .. } => "purge",
        }
    }
}
