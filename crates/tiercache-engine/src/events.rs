//! Entity notification bus.
//!
//! Entities and processors publish [`EntityEvent`]s; UI and dependency-graph
//! consumers subscribe. The bus is built on [`tokio::sync::broadcast`],
//! whose `send` is synchronous, so publishers on plain worker threads do not
//! need a runtime.
//!
//! Events are wrapped in [`Arc`] so that broadcasting to multiple
//! subscribers does not clone the change set. Publishing always happens
//! after the publisher has released its own locks; a subscriber may call
//! straight back into the entity.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use tiercache_engine::events::{EventBus, EntityEvent};
//! # async fn example() {
//! let bus = EventBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(EntityEvent::NeedsRecompute { entity_id: uuid::Uuid::now_v7() });
//!
//! let event = rx.recv().await.unwrap();
//! # }
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// What changed on an entity during one change scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// The bulk payload was replaced.
    Payload,
    /// The payload shape changed.
    Descriptor,
    /// The payload's numeric range changed.
    Range,
    /// Anything else the owner chooses to report.
    Metadata,
}

/// Union of change kinds accumulated by nested change scopes.
pub type ChangeSet = BTreeSet<ChangeKind>;

/// A notification about one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntityEvent {
    /// The entity went stale; its derived values need recomputing.
    NeedsRecompute { entity_id: Uuid },

    /// The outermost change scope closed with these accumulated changes.
    ContentChanged { entity_id: Uuid, changes: ChangeSet },

    /// A derived value finished recomputing (successfully or by falling
    /// back to its default).
    ProcessorUpdated {
        entity_id: Uuid,
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// The live count crossed zero.
    LivenessChanged { entity_id: Uuid, live: bool },

    /// The outermost transaction closed and deferred writes were flushed.
    Flushed { entity_id: Uuid },
}

impl EntityEvent {
    /// The entity this event is about.
    pub fn entity_id(&self) -> Uuid {
        match self {
            Self::NeedsRecompute { entity_id }
            | Self::ContentChanged { entity_id, .. }
            | Self::ProcessorUpdated { entity_id, .. }
            | Self::LivenessChanged { entity_id, .. }
            | Self::Flushed { entity_id } => *entity_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Fan-out of [`EntityEvent`]s to every open receiver.
///
/// Clones share one channel, so the registry and every entity publish into
/// the same stream.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<EntityEvent>>,
}

impl EventBus {
    /// Bus that buffers up to `capacity` undelivered events per receiver.
    /// Older events are overwritten and a slow receiver sees
    /// [`broadcast::error::RecvError::Lagged`] on its next `recv`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver `event` and return how many receivers got it. Entities
    /// publish whether or not anyone listens, so zero receivers is normal.
    pub fn publish(&self, event: EntityEvent) -> usize {
        let entity_id = event.entity_id();
        let delivered = self.sender.send(Arc::new(event)).unwrap_or(0);
        tracing::trace!(%entity_id, delivered, "entity event");
        delivered
    }

    /// Receiver for events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<EntityEvent>> {
        self.sender.subscribe()
    }

    /// Open receivers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
