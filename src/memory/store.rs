//! Write and read path for the memories table — the single source of truth.
//!
//! All SQL touching `memories` lives here. Writes commit synchronously;
//! transient `SQLITE_BUSY` failures are retried once after a short backoff
//! before surfacing `StoreUnavailable`. Mutation is row-local: metadata
//! merges and content updates run inside per-row transactions, and no
//! cross-row transaction is ever taken.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::time::Duration;

use crate::error::{MemoryError, Result};
use crate::memory::types::{ListFilter, MemoryRecord, EMBEDDING_ERROR_KEY};

/// Run a store operation, retrying once on SQLITE_BUSY / SQLITE_LOCKED.
pub(crate) fn busy_retry<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T> {
    match op() {
        Ok(v) => Ok(v),
        Err(e) if is_busy(&e) => {
            tracing::warn!("store busy, retrying once");
            std::thread::sleep(Duration::from_millis(100));
            op().map_err(MemoryError::from)
        }
        Err(e) => Err(e.into()),
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Append a new memory. Returns the assigned id.
///
/// `content = None` inserts a tombstone that the librarian will never index.
pub fn insert_memory(
    conn: &Connection,
    user_id: &str,
    content: Option<&str>,
    memory_type: &str,
    namespace: &str,
    metadata: Option<&Value>,
) -> Result<i64> {
    if user_id.is_empty() {
        return Err(MemoryError::InvalidInput("user_id must not be empty".into()));
    }
    if let Some(meta) = metadata {
        if !meta.is_object() {
            return Err(MemoryError::InvalidInput(
                "metadata must be a JSON object".into(),
            ));
        }
    }

    let now = chrono::Utc::now().to_rfc3339();
    let metadata_json = metadata.map(|m| m.to_string());

    busy_retry(|| {
        conn.execute(
            "INSERT INTO memories (user_id, content, metadata, memory_type, namespace, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![user_id, content, metadata_json, memory_type, namespace, now],
        )
    })?;

    Ok(conn.last_insert_rowid())
}

/// Fetch a single memory by id.
pub fn get_memory(conn: &Connection, id: i64) -> Result<MemoryRecord> {
    let row = busy_retry(|| {
        conn.query_row(
            "SELECT id, user_id, content, metadata, memory_type, namespace, created_at, updated_at \
             FROM memories WHERE id = ?1",
            params![id],
            map_record,
        )
        .optional()
    })?;
    row.ok_or(MemoryError::NotFound(id))
}

/// List memories, newest first by default.
pub fn list_memories(conn: &Connection, filter: &ListFilter) -> Result<Vec<MemoryRecord>> {
    let order_col = filter.order.as_sql();
    let sql = format!(
        "SELECT id, user_id, content, metadata, memory_type, namespace, created_at, updated_at \
         FROM memories \
         WHERE (?1 IS NULL OR namespace = ?1) \
           AND (?2 IS NULL OR created_at >= ?2) \
         ORDER BY {order_col} DESC LIMIT ?3"
    );

    let rows = busy_retry(|| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![filter.namespace, filter.since, filter.limit as i64],
                map_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })?;
    Ok(rows)
}

/// Merge keys into a row's metadata. Atomic per row: read and write happen
/// inside one transaction.
pub fn update_metadata(conn: &mut Connection, id: i64, patch: &Value) -> Result<()> {
    let patch_obj = patch
        .as_object()
        .ok_or_else(|| MemoryError::InvalidInput("metadata patch must be a JSON object".into()))?;

    let tx = conn.transaction().map_err(MemoryError::from)?;

    let current: Option<Option<String>> = tx
        .query_row(
            "SELECT metadata FROM memories WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(MemoryError::from)?;
    let current = current.ok_or(MemoryError::NotFound(id))?;

    let mut merged: Value = current
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_else(|| Value::Object(Default::default()));
    if !merged.is_object() {
        merged = Value::Object(Default::default());
    }
    for (key, val) in patch_obj {
        merged[key.as_str()] = val.clone();
    }

    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE memories SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
        params![merged.to_string(), now, id],
    )
    .map_err(MemoryError::from)?;
    tx.commit().map_err(MemoryError::from)?;
    Ok(())
}

/// Remove a key from a row's metadata, if present. Returns true when the key
/// existed. Used by the admin re-rank path to clear `sentiment_level`.
pub fn remove_metadata_key(conn: &mut Connection, id: i64, key: &str) -> Result<bool> {
    let tx = conn.transaction().map_err(MemoryError::from)?;

    let current: Option<Option<String>> = tx
        .query_row(
            "SELECT metadata FROM memories WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(MemoryError::from)?;
    let current = current.ok_or(MemoryError::NotFound(id))?;

    let mut meta: Value = current
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_else(|| Value::Object(Default::default()));

    let removed = meta
        .as_object_mut()
        .map(|obj| obj.remove(key).is_some())
        .unwrap_or(false);

    if removed {
        tx.execute(
            "UPDATE memories SET metadata = ?1 WHERE id = ?2",
            params![meta.to_string(), id],
        )
        .map_err(MemoryError::from)?;
    }
    tx.commit().map_err(MemoryError::from)?;
    Ok(removed)
}

/// Replace a row's content. Bumps `updated_at`, which (through the changed
/// content hash) makes the row stale so the librarian refreshes its vectors.
/// Any recorded `embedding_error` is cleared — the new content gets a fresh
/// chance.
pub fn update_content(conn: &mut Connection, id: i64, new_content: &str) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let updated = busy_retry(|| {
        conn.execute(
            "UPDATE memories SET content = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_content, now, id],
        )
    })?;
    if updated == 0 {
        return Err(MemoryError::NotFound(id));
    }
    remove_metadata_key(conn, id, EMBEDDING_ERROR_KEY)?;
    Ok(())
}

/// Soft-delete: null out the content, leaving the row as a tombstone.
pub fn tombstone(conn: &Connection, id: i64) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let updated = busy_retry(|| {
        conn.execute(
            "UPDATE memories SET content = NULL, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )
    })?;
    if updated == 0 {
        return Err(MemoryError::NotFound(id));
    }
    Ok(())
}

/// Explicit administrative removal: the row and all of its embedding entries
/// and vectors. Normal operation never calls this.
pub fn hard_delete(conn: &mut Connection, id: i64) -> Result<()> {
    let tx = conn.transaction().map_err(MemoryError::from)?;

    let keys: Vec<String> = tx
        .prepare("SELECT memory_id || ':' || chunk_ordinal FROM memory_embeddings WHERE memory_id = ?1")
        .and_then(|mut stmt| {
            stmt.query_map(params![id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()
        })
        .map_err(MemoryError::from)?;
    for key in keys {
        tx.execute("DELETE FROM memory_vec WHERE key = ?1", params![key])
            .map_err(MemoryError::from)?;
    }
    tx.execute("DELETE FROM memory_embeddings WHERE memory_id = ?1", params![id])
        .map_err(MemoryError::from)?;
    let deleted = tx
        .execute("DELETE FROM memories WHERE id = ?1", params![id])
        .map_err(MemoryError::from)?;
    tx.commit().map_err(MemoryError::from)?;

    if deleted == 0 {
        return Err(MemoryError::NotFound(id));
    }
    Ok(())
}

/// Per-namespace row counts, descending.
pub fn count_by_namespace(conn: &Connection) -> Result<Vec<(String, i64)>> {
    let rows = busy_retry(|| {
        let mut stmt = conn.prepare(
            "SELECT namespace, COUNT(*) FROM memories GROUP BY namespace ORDER BY COUNT(*) DESC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })?;
    Ok(rows)
}

pub fn total_count(conn: &Connection) -> Result<i64> {
    busy_retry(|| conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0)))
}

fn map_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let metadata_str: Option<String> = row.get(3)?;
    Ok(MemoryRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        content: row.get(2)?,
        metadata: metadata_str.and_then(|s| serde_json::from_str(&s).ok()),
        memory_type: row.get(4)?,
        namespace: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}
