//! Engine configuration.
//!
//! [`EngineConfig`] is built once at startup and handed to
//! [`EntityRegistry::new`](crate::EntityRegistry::new), which shares it with
//! every entity and processor it creates. Sensible defaults are provided via
//! the [`Default`] implementation, a builder-style API customises individual
//! fields, and [`EngineConfig::load`] reads a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EngineError, Result};

/// Tunables shared by the registry, entities and processors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum gap between two recomputes of the same derived value, in
    /// milliseconds.
    ///
    /// Default: **500 ms**.
    pub min_recompute_interval_ms: u64,

    /// Capacity of the notification bus. Subscribers lagging further behind
    /// than this miss events.
    ///
    /// Default: **256**.
    pub event_capacity: usize,

    /// Location of the durable cache database. `None` keeps derived values
    /// in memory only.
    ///
    /// Default: **None**.
    pub cache_path: Option<PathBuf>,

    /// Wrap the cache stack in a tracing tier that logs every call.
    ///
    /// Default: **false**.
    pub trace_cache: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_recompute_interval_ms: 500,
            event_capacity: 256,
            cache_path: None,
            trace_cache: false,
        }
    }
}

impl EngineConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML text. Missing fields keep defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| EngineError::Config {
            reason: format!("failed to parse TOML config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, falling back to defaults when it does not
    /// exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "configuration file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| EngineError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "configuration loaded from file");
        Ok(config)
    }

    /// The debounce interval as a [`Duration`].
    pub fn min_recompute_interval(&self) -> Duration {
        Duration::from_millis(self.min_recompute_interval_ms)
    }

    /// Set the minimum recompute interval.
    pub fn with_min_recompute_interval(mut self, interval: Duration) -> Self {
        self.min_recompute_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the notification bus capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Persist derived values to the SQLite database at `path`.
    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    /// Enable or disable the tracing cache tier.
    pub fn with_trace_cache(mut self, enabled: bool) -> Self {
        self.trace_cache = enabled;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(EngineError::Config {
                reason: "event_capacity must be at least 1".into(),
            });
        }
        Ok(())
    }
}
