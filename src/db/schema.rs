//! SQL DDL for all Archivist tables.
//!
//! Defines the `memories`, `memory_embeddings`, `memory_vec` (vec0), and
//! `schema_meta` tables. All DDL uses `IF NOT EXISTS` for idempotent
//! initialization. The vec0 table is created with the configured embedding
//! dimension, which is then pinned in `schema_meta`.

use rusqlite::Connection;

/// All fixed-shape DDL statements.
const SCHEMA_SQL: &str = r#"
-- Core memory storage. content is nullable: NULL marks a tombstone.
CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    content TEXT,
    metadata TEXT,
    memory_type TEXT NOT NULL DEFAULT 'general',
    namespace TEXT NOT NULL DEFAULT 'imported',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memories_namespace ON memories(namespace);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);

-- Derived embedding bookkeeping: one row per (memory, chunk).
-- The vector itself lives in memory_vec, keyed by "memory_id:ordinal".
CREATE TABLE IF NOT EXISTS memory_embeddings (
    memory_id INTEGER NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    chunk_ordinal INTEGER NOT NULL,
    source_hash TEXT NOT NULL,
    produced_at TEXT NOT NULL,
    PRIMARY KEY (memory_id, chunk_ordinal)
);

CREATE INDEX IF NOT EXISTS idx_embeddings_hash ON memory_embeddings(source_hash);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables for the given embedding dimension.
/// Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection, dimensions: usize) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    // vec0 virtual table must be created separately (sqlite-vec syntax).
    // The dimension is fixed at creation time.
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memory_vec USING vec0(\n\
         \x20   key TEXT PRIMARY KEY,\n\
         \x20   embedding FLOAT[{dimensions}]\n\
         );"
    ))?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('embedding_dim', ?1)",
        [dimensions.to_string()],
    )?;

    Ok(())
}

/// The embedding dimension the vec0 table was created with.
pub fn stored_dimensions(conn: &Connection) -> rusqlite::Result<Option<usize>> {
    meta_value(conn, "embedding_dim").map(|v| v.and_then(|s| s.parse::<usize>().ok()))
}

/// The embedding model id the index was built with, if one was ever pinned.
pub fn stored_embedding_model(conn: &Connection) -> rusqlite::Result<Option<String>> {
    meta_value(conn, "embedding_model")
}

/// Pin (or re-pin) the embedding model id.
pub fn pin_embedding_model(conn: &Connection, model: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('embedding_model', ?1)",
        [model],
    )?;
    Ok(())
}

fn meta_value(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    match conn.query_row(
        "SELECT value FROM schema_meta WHERE key = ?1",
        [key],
        |row| row.get::<_, String>(0),
    ) {
        Ok(val) => Ok(Some(val)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}
