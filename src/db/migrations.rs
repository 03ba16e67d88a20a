//! Forward-only schema migrations.
//!
//! Fresh databases come out of [`crate::db::schema::init_schema`] at version 1;
//! everything added since lives here as a numbered step. Steps run in order
//! inside [`apply_pending`] and each one records its version before the next
//! starts, so a crash mid-upgrade resumes cleanly.

use rusqlite::Connection;

/// Schema version this binary writes.
pub const SCHEMA_VERSION: u32 = 2;

struct Step {
    to: u32,
    description: &'static str,
    apply: fn(&Connection) -> rusqlite::Result<()>,
}

const STEPS: &[Step] = &[Step {
    to: 2,
    description: "composite (namespace, created_at) index for the priority walk",
    apply: add_priority_walk_index,
}];

/// Version currently recorded in `schema_meta`.
pub fn schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'schema_version'",
        [],
        |row| {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().unwrap_or(0))
        },
    )
}

fn record_version(conn: &Connection, version: u32) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE schema_meta SET value = ?1 WHERE key = 'schema_version'",
        [version.to_string()],
    )?;
    Ok(())
}

/// Bring the database up to [`SCHEMA_VERSION`].
pub fn apply_pending(conn: &Connection) -> rusqlite::Result<()> {
    let current = schema_version(conn)?;
    for step in STEPS.iter().filter(|s| s.to > current) {
        tracing::info!(to = step.to, description = step.description, "applying migration");
        (step.apply)(conn)?;
        record_version(conn, step.to)?;
    }
    Ok(())
}

/// v1 → v2: the priority retriever lists each namespace by recency; a
/// composite index keeps that walk off the full table.
fn add_priority_walk_index(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_memories_ns_created ON memories(namespace, created_at);",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        crate::db::schema::init_schema(&conn, 8).unwrap();
        conn
    }

    fn has_walk_index(conn: &Connection) -> bool {
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_memories_ns_created'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        n == 1
    }

    #[test]
    fn fresh_db_starts_at_version_1() {
        let conn = test_db();
        assert_eq!(schema_version(&conn).unwrap(), 1);
        assert!(!has_walk_index(&conn));
    }

    #[test]
    fn apply_pending_reaches_current_version() {
        let conn = test_db();
        apply_pending(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
        assert!(has_walk_index(&conn));
    }

    #[test]
    fn apply_pending_is_idempotent() {
        let conn = test_db();
        apply_pending(&conn).unwrap();
        apply_pending(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn steps_are_ordered_and_contiguous() {
        for (i, step) in STEPS.iter().enumerate() {
            assert_eq!(step.to, i as u32 + 2);
        }
        assert_eq!(STEPS.last().map(|s| s.to), Some(SCHEMA_VERSION));
    }
}
