//! Engine error types.
//!
//! Authoritative-path failures (loading or persisting a bulk payload,
//! unknown entities, invalid dependency edges) surface as [`EngineError`].
//! Cache-tier and derived-value failures never reach this type: they are
//! logged where they happen and degrade to a miss or a default value.

use tiercache_store::StoreError;
use uuid::Uuid;

/// Unified error type for the tiercache engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // -- Payload errors -----------------------------------------------------
    /// The payload store could not produce the entity's payload.
    #[error("failed to load payload for {entity_id}: {reason}")]
    PayloadLoad { entity_id: Uuid, reason: String },

    /// The payload store rejected a write.
    #[error("failed to write payload for {entity_id}: {reason}")]
    PayloadWrite { entity_id: Uuid, reason: String },

    /// The payload does not match its descriptor.
    #[error("payload shape mismatch: descriptor expects {expected} values, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    // -- Registry errors ----------------------------------------------------
    /// The referenced entity is not registered.
    #[error("entity not found: {entity_id}")]
    EntityNotFound { entity_id: Uuid },

    /// Adding the edge would make an entity depend on itself.
    #[error("dependency {source_id} -> {dependent_id} would create a cycle")]
    DependencyCycle { source_id: Uuid, dependent_id: Uuid },

    // -- Configuration ------------------------------------------------------
    /// The engine configuration could not be read or parsed.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// A cache tier failed while being opened.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Convenience alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, EngineError>;
