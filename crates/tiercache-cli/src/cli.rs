//! CLI argument definitions for tiercache.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// tiercache -- inspect and maintain durable derived-value caches.
#[derive(Parser)]
#[command(
    name = "tiercache",
    version,
    about = "tiercache -- inspect and maintain durable derived-value caches",
    long_about = "Reads and maintains the SQLite database written by the tiercache durable \
                  tier. The cache is disposable: purging records only forces recomputation."
)]
pub struct Cli {
    /// Default log level when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show record, dirty and target counts.
    Stats {
        /// Path to the cache database.
        db: PathBuf,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// List cached records, for one entity or all of them.
    Dump {
        /// Path to the cache database.
        db: PathBuf,

        /// Only show records of this entity.
        #[arg(long)]
        id: Option<Uuid>,

        /// Print one JSON object per line instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Remove every record of one entity.
    Purge {
        /// Path to the cache database.
        db: PathBuf,

        /// Entity whose records are removed.
        id: Uuid,
    },

    /// Populate a cache with synthetic entities and derived values.
    Demo {
        /// Path to the cache database.
        db: PathBuf,

        /// Number of entities to create.
        #[arg(long, default_value_t = 4)]
        entities: usize,

        /// Number of values per payload.
        #[arg(long, default_value_t = 1024)]
        values: usize,

        /// Engine configuration file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}
