//! The embedding index — derived, eventually consistent with the store.
//!
//! Bookkeeping rows live in `memory_embeddings` (one per chunk, carrying the
//! chunk's `source_hash`); vectors live in the `memory_vec` vec0 table keyed
//! by `"memory_id:ordinal"`. The whole index is rebuildable from the store.

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::{MemoryError, Result};
use crate::memory::{chunk_text, content_hash, embedding_to_bytes, l2_distance_to_cosine};

/// One bookkeeping row of the index.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingEntry {
    pub memory_id: i64,
    pub chunk_ordinal: i64,
    pub source_hash: String,
    pub produced_at: String,
}

fn vec_key(memory_id: i64, ordinal: i64) -> String {
    format!("{memory_id}:{ordinal}")
}

/// Insert or replace the vector for `(memory_id, chunk_ordinal)`. Idempotent:
/// re-running with the same inputs leaves exactly one row per pair.
pub fn upsert(
    conn: &mut Connection,
    memory_id: i64,
    chunk_ordinal: i64,
    vector: &[f32],
    source_hash: &str,
) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let key = vec_key(memory_id, chunk_ordinal);

    let tx = conn.transaction().map_err(MemoryError::from)?;
    // vec0 has no ON CONFLICT; delete-then-insert inside the transaction
    tx.execute("DELETE FROM memory_vec WHERE key = ?1", params![key])
        .map_err(MemoryError::from)?;
    tx.execute(
        "INSERT INTO memory_vec (key, embedding) VALUES (?1, ?2)",
        params![key, embedding_to_bytes(vector)],
    )
    .map_err(MemoryError::from)?;
    tx.execute(
        "INSERT OR REPLACE INTO memory_embeddings (memory_id, chunk_ordinal, source_hash, produced_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![memory_id, chunk_ordinal, source_hash, now],
    )
    .map_err(MemoryError::from)?;
    tx.commit().map_err(MemoryError::from)?;
    Ok(())
}

/// All bookkeeping rows for one memory, in ordinal order.
pub fn entries(conn: &Connection, memory_id: i64) -> Result<Vec<EmbeddingEntry>> {
    let mut stmt = conn.prepare(
        "SELECT memory_id, chunk_ordinal, source_hash, produced_at \
         FROM memory_embeddings WHERE memory_id = ?1 ORDER BY chunk_ordinal",
    )?;
    let rows = stmt
        .query_map(params![memory_id], |row| {
            Ok(EmbeddingEntry {
                memory_id: row.get(0)?,
                chunk_ordinal: row.get(1)?,
                source_hash: row.get(2)?,
                produced_at: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// True when the stored chunk hashes differ from the hashes of the current
/// content's chunks. Tombstones and empty content are never stale — there is
/// nothing to index.
pub fn is_stale(
    conn: &Connection,
    memory_id: i64,
    chunk_max: usize,
    chunk_overlap: usize,
) -> Result<bool> {
    let content: Option<String> = conn
        .query_row(
            "SELECT content FROM memories WHERE id = ?1",
            params![memory_id],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => MemoryError::NotFound(memory_id),
            other => other.into(),
        })?;

    let content = match content {
        Some(c) if !c.is_empty() => c,
        _ => return Ok(false),
    };

    let expected: Vec<String> = chunk_text(&content, chunk_max, chunk_overlap)
        .iter()
        .map(|chunk| content_hash(chunk))
        .collect();
    let stored: Vec<String> = entries(conn, memory_id)?
        .into_iter()
        .map(|e| e.source_hash)
        .collect();

    Ok(stored != expected)
}

/// Drop entries at or beyond `from_ordinal` — used when content shrinks to
/// fewer chunks than before.
pub fn truncate_entries(conn: &mut Connection, memory_id: i64, from_ordinal: i64) -> Result<()> {
    let tx = conn.transaction().map_err(MemoryError::from)?;
    let keys: Vec<String> = tx
        .prepare(
            "SELECT memory_id || ':' || chunk_ordinal FROM memory_embeddings \
             WHERE memory_id = ?1 AND chunk_ordinal >= ?2",
        )
        .and_then(|mut stmt| {
            stmt.query_map(params![memory_id, from_ordinal], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()
        })
        .map_err(MemoryError::from)?;
    for key in keys {
        tx.execute("DELETE FROM memory_vec WHERE key = ?1", params![key])
            .map_err(MemoryError::from)?;
    }
    tx.execute(
        "DELETE FROM memory_embeddings WHERE memory_id = ?1 AND chunk_ordinal >= ?2",
        params![memory_id, from_ordinal],
    )
    .map_err(MemoryError::from)?;
    tx.commit().map_err(MemoryError::from)?;
    Ok(())
}

/// Top-k memories by cosine similarity, deduplicated by memory id (best
/// chunk wins), optionally restricted to a namespace set.
///
/// Stale entries may be briefly visible; callers tolerate that by design.
pub fn search(
    conn: &Connection,
    query_vector: &[f32],
    k: usize,
    namespace_filter: Option<&[String]>,
) -> Result<Vec<(i64, f64)>> {
    if k == 0 {
        return Ok(Vec::new());
    }

    // Over-fetch: chunked memories can occupy several of the nearest slots,
    // and the namespace filter may discard candidates.
    let candidate_limit = (k * 4).max(20);
    let mut stmt = conn.prepare(
        "SELECT key, distance FROM memory_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let hits: Vec<(String, f64)> = stmt
        .query_map(params![embedding_to_bytes(query_vector), candidate_limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    // Dedup by memory_id, keeping the best (closest) chunk.
    let mut best: Vec<(i64, f64)> = Vec::new();
    for (key, distance) in hits {
        let memory_id = match key.split(':').next().and_then(|s| s.parse::<i64>().ok()) {
            Some(id) => id,
            None => continue,
        };
        let similarity = l2_distance_to_cosine(distance);
        match best.iter_mut().find(|(id, _)| *id == memory_id) {
            Some((_, s)) => {
                if similarity > *s {
                    *s = similarity;
                }
            }
            None => best.push((memory_id, similarity)),
        }
    }

    if let Some(namespaces) = namespace_filter {
        let allowed = fetch_namespaces(conn, &best)?;
        best.retain(|(id, _)| {
            allowed
                .iter()
                .any(|(mid, ns)| mid == id && namespaces.contains(ns))
        });
    }

    best.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    best.truncate(k);
    Ok(best)
}

fn fetch_namespaces(conn: &Connection, candidates: &[(i64, f64)]) -> Result<Vec<(i64, String)>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (1..=candidates.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT id, namespace FROM memories WHERE id IN ({})",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids: Vec<i64> = candidates.iter().map(|(id, _)| *id).collect();
    let params: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();
    let rows = stmt
        .query_map(params.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Remove index entries whose backing memory row is gone. Returns the number
/// of entries removed.
pub fn purge_orphans(conn: &mut Connection) -> Result<usize> {
    let tx = conn.transaction().map_err(MemoryError::from)?;

    let keys: Vec<String> = tx
        .prepare(
            "SELECT e.memory_id || ':' || e.chunk_ordinal FROM memory_embeddings e \
             LEFT JOIN memories m ON m.id = e.memory_id WHERE m.id IS NULL",
        )
        .and_then(|mut stmt| {
            stmt.query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()
        })
        .map_err(MemoryError::from)?;
    for key in &keys {
        tx.execute("DELETE FROM memory_vec WHERE key = ?1", params![key])
            .map_err(MemoryError::from)?;
    }
    let purged = tx
        .execute(
            "DELETE FROM memory_embeddings WHERE memory_id NOT IN (SELECT id FROM memories)",
            [],
        )
        .map_err(MemoryError::from)?;
    tx.commit().map_err(MemoryError::from)?;

    if purged > 0 {
        tracing::info!(purged, "purged orphan embedding entries");
    }
    Ok(purged)
}

pub fn entry_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM memory_embeddings", [], |row| row.get(0))?)
}

/// p90 of insert-to-fresh lag in seconds over the most recent entries.
/// `None` when the index is empty. Feeds the health surface's SLO check.
pub fn freshness_lag_p90(conn: &Connection) -> Result<Option<f64>> {
    let mut stmt = conn.prepare(
        "SELECT m.updated_at, e.produced_at FROM memory_embeddings e \
         JOIN memories m ON m.id = e.memory_id \
         ORDER BY e.produced_at DESC LIMIT 100",
    )?;
    let pairs: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut lags: Vec<f64> = pairs
        .iter()
        .filter_map(|(updated, produced)| {
            let u = chrono::DateTime::parse_from_rfc3339(updated).ok()?;
            let p = chrono::DateTime::parse_from_rfc3339(produced).ok()?;
            Some(((p - u).num_milliseconds() as f64 / 1000.0).max(0.0))
        })
        .collect();

    if lags.is_empty() {
        return Ok(None);
    }
    lags.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((lags.len() as f64) * 0.9).ceil() as usize;
    Ok(Some(lags[idx.saturating_sub(1).min(lags.len() - 1)]))
}
