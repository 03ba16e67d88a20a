//! The librarian: background vectorizer keeping the embedding index fresh.
//!
//! Two cadences drive it. A fast poll picks up rows inserted past the last
//! seen id; a slower full sweep re-hashes every live row and catches content
//! updates. Work is leased per memory id, embedded off the store lock, and
//! written back chunk by chunk. A single bad row never stops the loop: rows
//! that keep failing are poisoned via `embedding_error` metadata and skipped
//! until their content changes.

use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::LibrarianConfig;
use crate::error::{MemoryError, Result};
use crate::memory::types::EMBEDDING_ERROR_KEY;
use crate::memory::{chunk_text, content_hash, index, store};
use crate::provider::EmbeddingProvider;

/// Counters from one pass over the backlog.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub embedded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Error tags written to `embedding_error`. Rows carrying one are never
/// retried automatically.
mod poison {
    /// A chunk still exceeds the provider's input limit after chunking.
    pub const OVERSIZE: &str = "oversize";
    /// The provider rejected the content itself.
    pub const ENCODING: &str = "encoding";
    /// Transient failures exhausted `max_attempts`.
    pub const MAX_ATTEMPTS: &str = "max_attempts";
}

pub struct Librarian {
    conn: Arc<Mutex<Connection>>,
    provider: Arc<dyn EmbeddingProvider>,
    config: LibrarianConfig,
    /// Highest memory id already considered by the fast poll.
    high_water: i64,
    /// Transient failure counts, reset on success or content change.
    attempts: HashMap<i64, u32>,
    /// Current embed concurrency; shrinks under provider overload.
    concurrency: usize,
    success_streak: usize,
}

impl Librarian {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        provider: Arc<dyn EmbeddingProvider>,
        config: LibrarianConfig,
    ) -> Self {
        let concurrency = config.workers.max(1);
        Self {
            conn,
            provider,
            config,
            high_water: 0,
            attempts: HashMap::new(),
            concurrency,
            success_streak: 0,
        }
    }

    /// Run until the shutdown flag flips. The fast poll fires every
    /// `poll_interval_s`; every `freshness_sweep_interval_s` the pass widens
    /// into a full staleness sweep.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.config.workers,
            poll_s = self.config.poll_interval_s,
            sweep_s = self.config.freshness_sweep_interval_s,
            "librarian started"
        );
        let mut last_sweep = Instant::now();
        loop {
            let full = last_sweep.elapsed() >= Duration::from_secs(self.config.freshness_sweep_interval_s);
            if full {
                last_sweep = Instant::now();
            }

            match tokio::task::block_in_place(|| self.run_once(full)) {
                Ok(stats) if stats.scanned > 0 => {
                    debug!(?stats, full, "librarian pass complete");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "librarian pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.poll_interval_s)) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("librarian stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over the backlog. `full` re-checks every live row for
    /// staleness; otherwise only rows past the high-water mark are scanned.
    /// Always drains the whole candidate set before returning.
    pub fn run_once(&mut self, full: bool) -> Result<SweepStats> {
        let candidates = self.collect_candidates(full)?;
        let mut stats = SweepStats {
            scanned: candidates.len(),
            ..Default::default()
        };

        let mut pending: Vec<(i64, Vec<String>)> = Vec::new();
        for id in candidates {
            match self.lease(id)? {
                Some(chunks) => pending.push((id, chunks)),
                None => stats.skipped += 1,
            }
        }

        let mut queue = pending.into_iter();
        loop {
            let width = self.effective_concurrency();
            let wave: Vec<(i64, Vec<String>)> = queue.by_ref().take(width).collect();
            if wave.is_empty() {
                break;
            }
            let results = self.embed_wave(wave);
            for (id, chunks, outcome) in results {
                match outcome {
                    Ok(vectors) => {
                        self.finish(id, &chunks, vectors)?;
                        stats.embedded += 1;
                        self.on_success();
                    }
                    Err(MemoryError::Overloaded(msg)) => {
                        warn!(id, %msg, "embedding provider overloaded, shedding concurrency");
                        self.on_overload();
                        stats.failed += 1;
                        // Not counted as an attempt; the next pass retries.
                    }
                    Err(MemoryError::InvalidInput(msg)) => {
                        warn!(id, %msg, "content rejected by provider, poisoning row");
                        self.poison_row(id, poison::ENCODING)?;
                        stats.failed += 1;
                    }
                    Err(e) => {
                        stats.failed += 1;
                        self.on_failure(id, &e)?;
                    }
                }
            }
        }

        Ok(stats)
    }

    /// Ids worth looking at this pass, oldest first.
    fn collect_candidates(&mut self, full: bool) -> Result<Vec<i64>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = if full {
            conn.prepare("SELECT id FROM memories WHERE content IS NOT NULL ORDER BY id")?
        } else {
            conn.prepare("SELECT id FROM memories WHERE content IS NOT NULL AND id > ?1 ORDER BY id")?
        };
        let ids: Vec<i64> = if full {
            stmt.query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map(params![self.high_water], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        if let Some(max) = ids.last() {
            self.high_water = self.high_water.max(*max);
        }
        Ok(ids)
    }

    /// Check eligibility and take the work: returns the chunks to embed, or
    /// `None` when the row needs nothing.
    fn lease(&mut self, id: i64) -> Result<Option<Vec<String>>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let record = match store::get_memory(&conn, id) {
            Ok(r) => r,
            Err(MemoryError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let content = match record.content.as_deref() {
            Some(c) if c.chars().count() >= self.config.min_embed_len => c,
            _ => return Ok(None),
        };
        let poisoned = record
            .metadata
            .as_ref()
            .and_then(|m| m.get(EMBEDDING_ERROR_KEY))
            .is_some();
        if poisoned {
            return Ok(None);
        }
        if !index::is_stale(&conn, id, self.config.chunk_max, self.config.chunk_overlap)? {
            return Ok(None);
        }

        let chunks = chunk_text(content, self.config.chunk_max, self.config.chunk_overlap);
        let limit = self.provider.max_input_chars();
        if chunks.iter().any(|chunk| chunk.chars().count() > limit) {
            drop(conn);
            warn!(id, limit, "chunk exceeds provider input limit, poisoning row");
            self.poison_row(id, poison::OVERSIZE)?;
            return Ok(None);
        }
        Ok(Some(chunks))
    }

    /// Embed one wave of leased rows in parallel. Provider calls only — no
    /// store access happens on the worker threads.
    fn embed_wave(
        &self,
        wave: Vec<(i64, Vec<String>)>,
    ) -> Vec<(i64, Vec<String>, Result<Vec<Vec<f32>>>)> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = wave
                .into_iter()
                .map(|(id, chunks)| {
                    let provider = Arc::clone(&self.provider);
                    scope.spawn(move || {
                        let vectors: Result<Vec<Vec<f32>>> =
                            chunks.iter().map(|c| provider.embed(c)).collect();
                        (id, chunks, vectors)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("embed worker panicked"))
                .collect()
        })
    }

    /// Write back all chunk vectors and drop any stale trailing ordinals.
    fn finish(&mut self, id: i64, chunks: &[String], vectors: Vec<Vec<f32>>) -> Result<()> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        for (ordinal, (chunk, vector)) in chunks.iter().zip(vectors.iter()).enumerate() {
            index::upsert(&mut conn, id, ordinal as i64, vector, &content_hash(chunk))?;
        }
        index::truncate_entries(&mut conn, id, chunks.len() as i64)?;
        drop(conn);
        self.attempts.remove(&id);
        debug!(id, chunks = chunks.len(), "embedded");
        Ok(())
    }

    fn on_failure(&mut self, id: i64, error: &MemoryError) -> Result<()> {
        let count = self.attempts.entry(id).or_insert(0);
        *count += 1;
        warn!(id, attempt = *count, error = %error, "embedding failed");
        if *count >= self.config.max_attempts {
            self.attempts.remove(&id);
            self.poison_row(id, poison::MAX_ATTEMPTS)?;
        }
        self.success_streak = 0;
        Ok(())
    }

    /// Record a permanent failure on the row itself. `update_content` clears
    /// the tag, giving changed content a fresh chance.
    fn poison_row(&self, id: i64, reason: &str) -> Result<()> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        store::update_metadata(&mut conn, id, &serde_json::json!({ EMBEDDING_ERROR_KEY: reason }))
    }

    fn on_success(&mut self) {
        self.success_streak += 1;
        if self.success_streak >= 8 && self.concurrency < self.config.workers {
            self.concurrency = (self.concurrency * 2).min(self.config.workers);
            self.success_streak = 0;
            info!(concurrency = self.concurrency, "restoring embed concurrency");
        }
    }

    fn on_overload(&mut self) {
        self.concurrency = (self.concurrency / 2).max(1);
        self.success_streak = 0;
    }

    /// Configured concurrency, clamped by the advisory VRAM floor.
    fn effective_concurrency(&self) -> usize {
        if let Some(floor_mb) = self.config.min_free_vram_mb {
            if let Some(free_mb) = query_free_vram_mb() {
                if free_mb < floor_mb {
                    debug!(free_mb, floor_mb, "low VRAM, single-worker mode");
                    return 1;
                }
            }
        }
        self.concurrency
    }

    #[cfg(test)]
    fn current_concurrency(&self) -> usize {
        self.concurrency
    }
}

/// Best-effort free-VRAM probe via nvidia-smi. `None` when the tool is
/// missing or its output is unreadable; the caller then trusts the
/// configured concurrency.
fn query_free_vram_mb() -> Option<u64> {
    let output = std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_free_vram_mb(&String::from_utf8_lossy(&output.stdout))
}

fn parse_free_vram_mb(output: &str) -> Option<u64> {
    output.lines().next()?.trim().parse().ok()
}
