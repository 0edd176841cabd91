//! CLI entry point for tiercache.
//!
//! This binary provides the `tiercache` command with subcommands for
//! inspecting, purging and populating a durable cache database.

mod cli;
mod commands;
mod helpers;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    helpers::init_tracing(&cli.log_level);

    match cli.command {
        Commands::Stats { db, json } => commands::cmd_stats(&db, json),
        Commands::Dump { db, id, json } => commands::cmd_dump(&db, id, json),
        Commands::Purge { db, id } => commands::cmd_purge(&db, id),
        Commands::Demo {
            db,
            entities,
            values,
            config,
        } => commands::cmd_demo(&db, entities, values, config.as_deref()).await,
    }
}
