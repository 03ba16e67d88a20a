//! Importance ranking of memories via a local LLM.
//!
//! Pages through rows whose metadata has no `sentiment_level`, asks the
//! model for a single digit, and merges `{"sentiment_level": N}` back into
//! each row. Polarity is 1 = critical, 5 = minimal. Already-ranked rows are
//! never selected, so the pass is idempotent; re-ranking is an explicit
//! admin operation that clears the key first.

use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::RankerConfig;
use crate::error::Result;
use crate::memory::store;
use crate::memory::types::{RANK_ERROR_KEY, SENTIMENT_LEVEL_KEY};
use crate::provider::LlmProvider;

/// The rubric sent to the model. `{content}` is replaced with the first
/// 1,000 characters of the memory.
pub const RANK_PROMPT: &str = "Analyze this memory and rate its importance/emotional weight on a 1-5 scale:

1 = CRITICAL (constitution, core values, sovereignty, breakthrough moments, key decisions)
2 = IMPORTANT (technical achievements, relationship dynamics, infrastructure wins)
3 = MODERATE (useful context, preferences, workflow notes)
4 = LOW (routine operations, minor details)
5 = MINIMAL (metadata, timestamps, trivial info)

Memory: {content}

Respond with ONLY a single digit 1-5. No explanation.";

/// Applied when the model's answer is unparseable or the provider fails.
pub const DEFAULT_RANK: i64 = 3;

/// Content shorter than this (trimmed) is trivially MINIMAL, no model call.
const TRIVIAL_LEN: usize = 10;

const RANK_TEMPERATURE: f64 = 0.1;
const RANK_MAX_TOKENS: u32 = 5;
const PROMPT_CONTENT_CHARS: usize = 1000;

/// Outcome of one ranking pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RankReport {
    pub ranked: usize,
    /// Counts of levels 1..=5, index 0 = level 1.
    pub distribution: [usize; 5],
    pub error_count: usize,
}

pub struct Ranker {
    conn: Arc<Mutex<Connection>>,
    provider: Arc<dyn LlmProvider>,
    config: RankerConfig,
}

impl Ranker {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        provider: Arc<dyn LlmProvider>,
        config: RankerConfig,
    ) -> Self {
        Self {
            conn,
            provider,
            config,
        }
    }

    /// Rows currently eligible for ranking.
    pub fn unranked_count(&self) -> Result<i64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE content IS NOT NULL \
             AND json_extract(COALESCE(metadata, '{}'), '$.sentiment_level') IS NULL",
            [],
            |row| row.get(0),
        )?)
    }

    /// Rank up to `max_rows` unranked rows. `progress` is called with the
    /// number of rows completed in each batch (drives the CLI progress bar).
    pub fn rank_unranked(
        &self,
        max_rows: usize,
        progress: impl Fn(usize) + Sync,
    ) -> Result<RankReport> {
        let page_limit = max_rows.min(self.config.page_size);
        let page = self.fetch_unranked(page_limit)?;
        if page.is_empty() {
            return Ok(RankReport::default());
        }
        info!(rows = page.len(), model = %self.config.model, "ranking pass started");

        let batch_size = self.config.batch_size.max(1);
        let batches: Vec<Vec<(i64, String)>> = page
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();

        let mut report = RankReport::default();
        let workers = self.config.workers.max(1);
        let mut queue = batches.into_iter();
        loop {
            let wave: Vec<Vec<(i64, String)>> = queue.by_ref().take(workers).collect();
            if wave.is_empty() {
                break;
            }
            let results = self.rank_wave(wave);
            for (id, level, errored) in results {
                self.commit(id, level, errored)?;
                report.ranked += 1;
                report.distribution[(level - 1) as usize] += 1;
                if errored {
                    report.error_count += 1;
                }
            }
            progress(report.ranked);
        }

        info!(
            ranked = report.ranked,
            errors = report.error_count,
            distribution = ?report.distribution,
            "ranking pass complete"
        );
        Ok(report)
    }

    /// Admin re-rank: clear `sentiment_level` (and any stale `rank_error`)
    /// from every row, returning how many were cleared.
    pub fn clear_ranks(&self) -> Result<usize> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let ids: Vec<i64> = conn
            .prepare(
                "SELECT id FROM memories \
                 WHERE json_extract(COALESCE(metadata, '{}'), '$.sentiment_level') IS NOT NULL",
            )?
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for id in &ids {
            store::remove_metadata_key(&mut conn, *id, SENTIMENT_LEVEL_KEY)?;
            store::remove_metadata_key(&mut conn, *id, RANK_ERROR_KEY)?;
        }
        Ok(ids.len())
    }

    /// Distribution of levels 1..=5 across all ranked rows.
    pub fn distribution(conn: &Connection) -> Result<[usize; 5]> {
        let mut dist = [0usize; 5];
        let mut stmt = conn.prepare(
            "SELECT json_extract(metadata, '$.sentiment_level'), COUNT(*) FROM memories \
             WHERE json_extract(COALESCE(metadata, '{}'), '$.sentiment_level') IS NOT NULL \
             GROUP BY 1",
        )?;
        let rows: Vec<(i64, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (level, count) in rows {
            if (1..=5).contains(&level) {
                dist[(level - 1) as usize] = count as usize;
            }
        }
        Ok(dist)
    }

    fn fetch_unranked(&self, limit: usize) -> Result<Vec<(i64, String)>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, content FROM memories WHERE content IS NOT NULL \
             AND json_extract(COALESCE(metadata, '{}'), '$.sentiment_level') IS NULL \
             ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Rank one wave of batches in parallel. Model calls only — no store
    /// access on the worker threads.
    fn rank_wave(&self, wave: Vec<Vec<(i64, String)>>) -> Vec<(i64, i64, bool)> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = wave
                .into_iter()
                .map(|batch| {
                    let provider = Arc::clone(&self.provider);
                    scope.spawn(move || {
                        batch
                            .into_iter()
                            .map(|(id, content)| {
                                let (level, errored) = rank_one(provider.as_ref(), &content);
                                (id, level, errored)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().expect("rank worker panicked"))
                .collect()
        })
    }

    fn commit(&self, id: i64, level: i64, errored: bool) -> Result<()> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let patch = if errored {
            serde_json::json!({ SENTIMENT_LEVEL_KEY: level, RANK_ERROR_KEY: true })
        } else {
            serde_json::json!({ SENTIMENT_LEVEL_KEY: level })
        };
        store::update_metadata(&mut conn, id, &patch)?;
        debug!(id, level, errored, "ranked");
        Ok(())
    }
}

/// Rank a single content string. Returns `(level, errored)`.
fn rank_one(provider: &dyn LlmProvider, content: &str) -> (i64, bool) {
    if content.trim().chars().count() < TRIVIAL_LEN {
        return (5, false);
    }

    let excerpt: String = content.chars().take(PROMPT_CONTENT_CHARS).collect();
    let prompt = RANK_PROMPT.replace("{content}", &excerpt);

    match provider.complete(&prompt, RANK_TEMPERATURE, RANK_MAX_TOKENS) {
        Ok(response) => (parse_rank(&response).unwrap_or(DEFAULT_RANK), false),
        Err(e) => {
            warn!(error = %e, "rank call failed, applying default");
            (DEFAULT_RANK, true)
        }
    }
}

/// First digit in 1..=5 found in the response, if any.
pub fn parse_rank(response: &str) -> Option<i64> {
    response
        .chars()
        .find(|c| ('1'..='5').contains(c))
        .and_then(|c| c.to_digit(10))
        .map(i64::from)
}
