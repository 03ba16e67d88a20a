//! Presence probe and primary→local sync.
//!
//! A node may be paired with a remote primary store. Before a session binds
//! its database, a short TCP connect decides which endpoint to use: probe
//! success selects the primary, failure selects the local replica. The sync
//! is a one-way tail pull of recent primary rows into the local store,
//! deduplicated on `(content, created_at)`. Local-only rows are never
//! touched; reconciliation back to the primary is a manual operation.

use rusqlite::{params, Connection};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{expand_tilde, StorageConfig};
use crate::error::{MemoryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    Primary,
    Local,
}

impl std::fmt::Display for StoreRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// The endpoint a session should bind.
#[derive(Debug, Clone)]
pub struct SelectedStore {
    pub role: StoreRole,
    pub path: PathBuf,
}

/// TCP presence probe. True when a connection can be established within the
/// timeout.
pub fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(a) => a,
        Err(e) => {
            debug!(host, port, error = %e, "probe address resolution failed");
            return false;
        }
    };
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, timeout).is_ok() {
            return true;
        }
    }
    false
}

/// Decide which store this session binds. The primary is chosen only when a
/// probe target is configured, a primary path exists, and the probe passes.
pub fn select_store(storage: &StorageConfig) -> SelectedStore {
    let local = SelectedStore {
        role: StoreRole::Local,
        path: expand_tilde(&storage.local_db_path),
    };

    let (Some(host), Some(primary_path)) = (&storage.probe_host, &storage.primary_db_path) else {
        return local;
    };

    let timeout = Duration::from_secs(storage.probe_timeout_s);
    if probe(host, storage.probe_port, timeout) {
        debug!(host, port = storage.probe_port, "presence probe passed, using primary");
        SelectedStore {
            role: StoreRole::Primary,
            path: expand_tilde(primary_path),
        }
    } else {
        warn!(host, port = storage.probe_port, "presence probe failed, falling back to local");
        local
    }
}

/// Counters from one sync run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub fetched: usize,
    pub synced: usize,
    pub skipped: usize,
}

/// Pull primary rows from the last `window_days` into the local store.
///
/// Re-entrant: rows already present locally (same `content` and
/// `created_at`) are skipped, and re-running after a partial failure picks
/// up where it left off. Ids are not carried over — each store assigns its
/// own.
pub fn sync_from_primary(
    primary: &Connection,
    local: &Connection,
    window_days: u64,
) -> Result<SyncReport> {
    let cutoff = (chrono::Utc::now() - chrono::Duration::days(window_days as i64)).to_rfc3339();

    let mut stmt = primary.prepare(
        "SELECT user_id, content, metadata, memory_type, namespace, created_at, updated_at \
         FROM memories WHERE created_at >= ?1 ORDER BY created_at",
    )?;
    let rows: Vec<(String, Option<String>, Option<String>, String, String, String, String)> = stmt
        .query_map(params![cutoff], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut report = SyncReport {
        fetched: rows.len(),
        ..Default::default()
    };

    for (user_id, content, metadata, memory_type, namespace, created_at, updated_at) in rows {
        // `IS` instead of `=` so tombstones (NULL content) dedup too
        let exists: i64 = local.query_row(
            "SELECT COUNT(*) FROM memories WHERE content IS ?1 AND created_at = ?2",
            params![content, created_at],
            |row| row.get(0),
        )?;
        if exists > 0 {
            report.skipped += 1;
            continue;
        }
        local
            .execute(
                "INSERT INTO memories (user_id, content, metadata, memory_type, namespace, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![user_id, content, metadata, memory_type, namespace, created_at, updated_at],
            )
            .map_err(MemoryError::from)?;
        report.synced += 1;
    }

    info!(
        fetched = report.fetched,
        synced = report.synced,
        skipped = report.skipped,
        window_days,
        "sync complete"
    );
    Ok(report)
}
