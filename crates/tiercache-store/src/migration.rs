//! Schema migration system for the durable cache table.
//!
//! Migrations are stored as static SQL strings keyed by version number.
//! The current version is tracked in a `_migrations` table so migrations
//! are idempotent and only run once.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// A single migration definition.
struct Migration {
    /// Monotonically increasing version number (1, 2, 3, ...).
    version: u32,
    /// Human-readable description.
    description: &'static str,
    /// Raw SQL to execute. May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// All migrations in order. Add new migrations to the end of this array.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "cache records keyed by (entity id, key)",
        sql: r#"
            CREATE TABLE cache_records (
                id         TEXT NOT NULL,
                key        TEXT NOT NULL,
                value      BLOB NOT NULL,
                dirty      INTEGER NOT NULL DEFAULT 0 CHECK(dirty IN (0, 1)),
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (id, key)
            );
        "#,
    },
    Migration {
        version: 2,
        description: "index dirty records for maintenance scans",
        sql: r#"
            CREATE INDEX idx_cache_records_dirty ON cache_records(dirty);
        "#,
    },
];

/// Bring the schema on `conn` up to the latest version.
///
/// Runs synchronously; the durable worker calls it once before draining
/// its queue.
pub fn run_all(conn: &mut Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| migration_error(0, "failed to create _migrations table", e))?;

    let current = current_version(conn)?;
    let pending = MIGRATIONS.iter().filter(|m| m.version > current);

    let mut applied = 0usize;
    for migration in pending {
        apply(conn, migration)?;
        applied += 1;
    }

    if applied == 0 {
        debug!(current_version = current, "cache schema is up to date");
    } else {
        info!(
            from_version = current,
            applied,
            "cache schema migrated"
        );
    }
    Ok(())
}

/// Return the latest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| migration_error(0, "failed to read current version", e))
}

// ── internals ────────────────────────────────────────────────────────

fn migration_error(version: u32, context: &str, err: rusqlite::Error) -> StoreError {
    StoreError::Migration {
        version,
        message: format!("{context}: {err}"),
    }
}

/// Apply a single migration inside a transaction. Dropping the transaction
/// on an error path rolls it back.
fn apply(conn: &mut Connection, migration: &Migration) -> StoreResult<()> {
    debug!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    let tx = conn
        .transaction()
        .map_err(|e| migration_error(migration.version, "failed to begin transaction", e))?;

    if let Err(e) = tx.execute_batch(migration.sql) {
        warn!(version = migration.version, %e, "migration failed, rolling back");
        return Err(migration_error(migration.version, "SQL execution failed", e));
    }

    tx.execute(
        "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            migration.version,
            migration.description,
            chrono::Utc::now().timestamp()
        ],
    )
    .map_err(|e| migration_error(migration.version, "failed to record migration", e))?;

    tx.commit()
        .map_err(|e| migration_error(migration.version, "failed to commit", e))
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn migrations_are_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(
                window[1].version > window[0].version,
                "migration versions must be strictly increasing: {} >= {}",
                window[0].version,
                window[1].version,
            );
        }
    }

    /// The expected latest migration version (update when adding migrations).
    const LATEST_VERSION: u32 = 2;

    #[test]
    fn run_all_on_fresh_db() {
        let mut conn = setup_conn();
        run_all(&mut conn).unwrap();

        let version = current_version(&conn).unwrap();
        assert_eq!(version, LATEST_VERSION);
    }

    #[test]
    fn run_all_is_idempotent() {
        let mut conn = setup_conn();
        run_all(&mut conn).unwrap();
        run_all(&mut conn).unwrap();

        let version = current_version(&conn).unwrap();
        assert_eq!(version, LATEST_VERSION);
    }

    #[test]
    fn cache_records_primary_key_is_id_and_key() {
        let mut conn = setup_conn();
        run_all(&mut conn).unwrap();

        conn.execute(
            "INSERT INTO cache_records (id, key, value, dirty, updated_at) VALUES ('a', 'k', x'00', 0, 0)",
            [],
        )
        .unwrap();
        // Same key under another id is fine.
        conn.execute(
            "INSERT INTO cache_records (id, key, value, dirty, updated_at) VALUES ('b', 'k', x'00', 0, 0)",
            [],
        )
        .unwrap();
        // Duplicate (id, key) violates the primary key.
        let duplicate = conn.execute(
            "INSERT INTO cache_records (id, key, value, dirty, updated_at) VALUES ('a', 'k', x'01', 1, 0)",
            [],
        );
        assert!(duplicate.is_err());
    }

    #[test]
    fn dirty_flag_is_constrained() {
        let mut conn = setup_conn();
        run_all(&mut conn).unwrap();

        let bad = conn.execute(
            "INSERT INTO cache_records (id, key, value, dirty, updated_at) VALUES ('a', 'k', x'00', 2, 0)",
            [],
        );
        assert!(bad.is_err());
    }
}
