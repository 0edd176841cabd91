//! Derivations: the computations behind derived-value processors.

use std::fmt;

use serde_json::json;
use tiercache_store::CacheValue;

use crate::payload::{Payload, PayloadDescriptor};

/// Computes one derived value from a payload.
///
/// `compute` errors are reported as strings; the processor logs them and
/// falls back to [`Derivation::default_value`].
pub trait Derivation: Send + Sync {
    fn compute(&self, payload: &Payload) -> Result<CacheValue, String>;

    /// Value to use when the payload is unavailable or `compute` fails.
    fn default_value(&self, _descriptor: Option<&PayloadDescriptor>) -> Option<CacheValue> {
        None
    }
}

/// `{"min": .., "max": ..}` over the finite values.
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeDerivation;

impl Derivation for RangeDerivation {
    fn compute(&self, payload: &Payload) -> Result<CacheValue, String> {
        let range = payload
            .range()
            .ok_or_else(|| "payload has no finite values".to_string())?;
        Ok(json!({ "min": range.min, "max": range.max }))
    }
}

/// `{"count", "mean", "min", "max"}` over the finite values.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsDerivation;

impl Derivation for StatsDerivation {
    fn compute(&self, payload: &Payload) -> Result<CacheValue, String> {
        let finite: Vec<f64> = payload
            .values()
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .collect();
        if finite.is_empty() {
            return Err("payload has no finite values".into());
        }
        let sum: f64 = finite.iter().sum();
        let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Ok(json!({
            "count": finite.len(),
            "mean": sum / finite.len() as f64,
            "min": min,
            "max": max,
        }))
    }

    fn default_value(&self, _descriptor: Option<&PayloadDescriptor>) -> Option<CacheValue> {
        Some(json!({ "count": 0 }))
    }
}

/// Number of elements. Known from the descriptor alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElementCount;

impl Derivation for ElementCount {
    fn compute(&self, payload: &Payload) -> Result<CacheValue, String> {
        Ok(json!(payload.len()))
    }

    fn default_value(&self, descriptor: Option<&PayloadDescriptor>) -> Option<CacheValue> {
        descriptor.map(|d| json!(d.element_count()))
    }
}

/// Wraps a closure as a [`Derivation`].
pub struct FnDerivation<F> {
    compute: F,
    default: Option<CacheValue>,
}

impl<F> FnDerivation<F>
where
    F: Fn(&Payload) -> Result<CacheValue, String> + Send + Sync,
{
    pub fn new(compute: F) -> Self {
        Self {
            compute,
            default: None,
        }
    }

    pub fn with_default(mut self, default: CacheValue) -> Self {
        self.default = Some(default);
        self
    }
}

impl<F> Derivation for FnDerivation<F>
where
    F: Fn(&Payload) -> Result<CacheValue, String> + Send + Sync,
{
    fn compute(&self, payload: &Payload) -> Result<CacheValue, String> {
        (self.compute)(payload)
    }

    fn default_value(&self, _descriptor: Option<&PayloadDescriptor>) -> Option<CacheValue> {
        self.default.clone()
    }
}

impl<F> fmt::Debug for FnDerivation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnDerivation")
            .field("default", &self.default)
            .finish_non_exhaustive()
    }
}
