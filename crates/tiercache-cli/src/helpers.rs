//! Shared helper functions used across CLI subcommands.

use std::path::Path;

use anyhow::{Context, Result, bail};
use tiercache_store::DurableCache;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Open an existing cache database. Missing files are an error: opening
/// would silently create an empty database.
pub fn open_existing(db: &Path) -> Result<DurableCache> {
    if !db.exists() {
        bail!("cache database {} does not exist", db.display());
    }
    DurableCache::open(db).with_context(|| format!("failed to open {}", db.display()))
}

/// Render a cached value on one line, truncated to `max` characters.
pub fn preview(value: &serde_json::Value, max: usize) -> String {
    let text = value.to_string();
    if text.chars().count() <= max {
        return text;
    }
    let mut cut: String = text.chars().take(max.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}
