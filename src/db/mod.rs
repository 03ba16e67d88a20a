pub mod migrations;
pub mod schema;

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) an Archivist database at the given path, with the vec
/// extension loaded and schema initialized for `dimensions`-wide embeddings.
///
/// Refuses to open a database whose vec0 table was created for a different
/// dimension — the index has to be rebuilt before the model can change.
pub fn open_database(path: impl AsRef<Path>, dimensions: usize) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    // WAL for concurrent readers; busy_timeout bounds writer contention.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", "10000")?;

    schema::init_schema(&conn, dimensions).context("failed to initialize schema")?;

    // The dim pin is INSERT OR IGNORE, so an existing database keeps the
    // dimension it was created with and a mismatch shows up here.
    if let Some(stored) = schema::stored_dimensions(&conn)? {
        if stored != dimensions {
            bail!(
                "embedding dimension mismatch: database was created with {stored}, \
                 config says {dimensions}. Rebuild the index (`archivist maintenance purge-orphans` \
                 after dropping memory_vec) or restore the old embedding model."
            );
        }
    }

    migrations::apply_pending(&conn).context("failed to run migrations")?;

    tracing::info!(path = %path.display(), dimensions, "database initialized");
    Ok(conn)
}

/// Pin the embedding model on first open; after that, warn when the
/// configured model differs from the one the index was built with. A swap at
/// the same dimension passes the vec0 check but makes old and new vectors
/// incomparable, so the existing entries should be re-embedded.
pub fn check_embedding_model(conn: &Connection, model: &str) -> Result<()> {
    match schema::stored_embedding_model(conn)? {
        None => schema::pin_embedding_model(conn, model)?,
        Some(stored) if stored != model => {
            tracing::warn!(
                %stored,
                configured = %model,
                "embedding model changed; existing vectors were produced by the old model — \
                 re-embed (librarian will not do this automatically) or restore the old model"
            );
        }
        Some(_) => {}
    }
    Ok(())
}

/// Open an in-memory database. Used by tests and ephemeral runs; the schema
/// matches [`open_database`] exactly.
pub fn open_memory_database(dimensions: usize) -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn, dimensions).context("failed to initialize schema")?;
    migrations::apply_pending(&conn).context("failed to run migrations")?;
    Ok(conn)
}
