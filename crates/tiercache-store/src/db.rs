//! SQLite connection setup for the durable tier.
//!
//! Connections are opened with WAL mode and performance pragmas, then the
//! cache schema is migrated. The durable worker thread owns the resulting
//! [`Connection`] exclusively, so no locking wrapper is needed here.

use std::path::Path;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StoreResult;
use crate::migration;

/// Open (or create) the cache database at `path`, apply pragmas, and run
/// pending migrations.
pub fn open_connection(path: impl AsRef<Path>) -> StoreResult<Connection> {
    let path = path.as_ref();
    info!(path = %path.display(), "opening cache database");

    let mut conn = Connection::open(path)?;
    apply_pragmas(&conn)?;
    migration::run_all(&mut conn)?;
    Ok(conn)
}

/// Open a migrated in-memory cache database.
pub fn open_in_memory() -> StoreResult<Connection> {
    debug!("opening in-memory cache database");

    let mut conn = Connection::open_in_memory()?;
    apply_pragmas(&conn)?;
    migration::run_all(&mut conn)?;
    Ok(conn)
}

// ── pragmas ──────────────────────────────────────────────────────────

/// Apply performance pragmas to a fresh connection.
fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
    // WAL mode: readers in other processes never block the single writer.
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // NORMAL sync is safe with WAL; a power loss can drop the last commit
    // but never corrupts the file. The cache is disposable.
    conn.pragma_update(None, "synchronous", "NORMAL")?;

    // 64 MiB memory-mapped I/O for hot records.
    conn.pragma_update(None, "mmap_size", 67_108_864_i64)?;

    // Negative value means KiB: ~16 MiB page cache.
    conn.pragma_update(None, "cache_size", -16_000_i32)?;

    conn.pragma_update(None, "temp_store", "MEMORY")?;

    // Maintenance tools may open the same file while the worker is writing.
    conn.pragma_update(None, "busy_timeout", 5_000_i32)?;

    debug!("cache database pragmas applied (WAL, mmap 64MiB)");
    Ok(())
}

// ── tests ────────────────────────────────────────────────────────────
