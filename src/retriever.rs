//! Context assembly under a token budget.
//!
//! Two modes. Priority mode walks the configured namespace list, most
//! important first, pulling the most recent rows of each. Semantic mode
//! walks the index search result for a caller-supplied query vector instead.
//! Callers embed the query before taking the store lock — no model call ever
//! runs with the lock held. Both modes feed the same budget walk: rows
//! joined by a fixed delimiter, the first overflowing row truncated to
//! exactly fill the remaining budget, then stop.
//!
//! The budget is counted in characters using a coarse chars-per-token
//! estimate; given the same store snapshot and inputs the output is
//! byte-identical.

use rusqlite::Connection;
use serde::Serialize;

use crate::config::RetrievalConfig;
use crate::error::Result;
use crate::memory::types::{ListFilter, ListOrder, MemoryRecord};
use crate::memory::{index, store};

/// Separator between memories in a bundle.
pub const DELIMITER: &str = "\n----\n";

/// Sentiment assumed for rows the ranker has not visited.
const UNRANKED_SENTIMENT: i64 = 3;

/// An assembled context bundle.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    pub text: String,
    pub used_tokens: usize,
    pub memory_ids: Vec<i64>,
}

/// Namespace-priority mode: no query, fixed namespace order, recency within
/// each namespace.
pub fn load_priority_context(
    conn: &Connection,
    config: &RetrievalConfig,
    budget_tokens: Option<usize>,
) -> Result<ContextBundle> {
    let budget_tokens = budget_tokens.unwrap_or(config.token_budget_default);
    let mut walk = BudgetWalk::new(budget_tokens, config.chars_per_token_estimate);

    'outer: for entry in &config.namespace_priority_list {
        let filter = ListFilter {
            namespace: Some(entry.namespace.clone()),
            since: None,
            limit: entry.limit,
            order: ListOrder::CreatedAt,
        };
        for record in store::list_memories(conn, &filter)? {
            let Some(content) = record.content.as_deref() else {
                continue;
            };
            if content.is_empty() {
                continue;
            }
            if !walk.push(record.id, content) {
                break 'outer;
            }
        }
    }

    Ok(walk.finish(config.chars_per_token_estimate))
}

/// Semantic mode: nearest memories to the query first, similarity ties
/// broken by sentiment (lower level = more important).
pub fn load_semantic_context(
    conn: &Connection,
    config: &RetrievalConfig,
    query_vector: &[f32],
    budget_tokens: Option<usize>,
    namespaces: Option<&[String]>,
) -> Result<ContextBundle> {
    let budget_tokens = budget_tokens.unwrap_or(config.token_budget_default);
    let ordered = search_ranked(conn, query_vector, config.search_k, namespaces)?;

    let mut walk = BudgetWalk::new(budget_tokens, config.chars_per_token_estimate);
    for (record, _) in ordered {
        let Some(content) = record.content.as_deref() else {
            continue;
        };
        if content.is_empty() {
            continue;
        }
        if !walk.push(record.id, content) {
            break;
        }
    }
    Ok(walk.finish(config.chars_per_token_estimate))
}

/// Matching records for a query vector, best first. Similarity ties are
/// broken by `sentiment_level`; rows the ranker has not visited count as
/// level 3.
pub fn search_ranked(
    conn: &Connection,
    query_vector: &[f32],
    k: usize,
    namespaces: Option<&[String]>,
) -> Result<Vec<(MemoryRecord, f64)>> {
    let hits = index::search(conn, query_vector, k, namespaces)?;

    let mut result = Vec::with_capacity(hits.len());
    for (memory_id, similarity) in hits {
        match store::get_memory(conn, memory_id) {
            Ok(record) => result.push((record, similarity)),
            // Search can briefly see entries for rows deleted since; skip.
            Err(crate::error::MemoryError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        }
    }

    result.sort_by(|(ra, sa), (rb, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| sentiment_or_default(ra).cmp(&sentiment_or_default(rb)))
    });
    Ok(result)
}

fn sentiment_or_default(record: &MemoryRecord) -> i64 {
    record.sentiment_level().unwrap_or(UNRANKED_SENTIMENT)
}

/// The budget walk shared by both modes. Counts characters; the first row
/// that would overflow is cut to exactly fill the budget.
struct BudgetWalk {
    text: String,
    used_chars: usize,
    budget_chars: usize,
    memory_ids: Vec<i64>,
    full: bool,
}

impl BudgetWalk {
    fn new(budget_tokens: usize, chars_per_token: usize) -> Self {
        Self {
            text: String::new(),
            used_chars: 0,
            budget_chars: budget_tokens * chars_per_token,
            memory_ids: Vec::new(),
            full: false,
        }
    }

    /// Append a row. Returns false once the budget is exhausted.
    fn push(&mut self, id: i64, content: &str) -> bool {
        if self.full {
            return false;
        }
        let sep = if self.text.is_empty() { "" } else { DELIMITER };
        let sep_chars = sep.chars().count();
        let content_chars = content.chars().count();
        let remaining = self.budget_chars - self.used_chars;

        if sep_chars + content_chars <= remaining {
            self.text.push_str(sep);
            self.text.push_str(content);
            self.used_chars += sep_chars + content_chars;
            self.memory_ids.push(id);
            return true;
        }

        // Overflow: truncate into whatever room is left, then stop.
        let room = remaining.saturating_sub(sep_chars);
        if room > 0 {
            self.text.push_str(sep);
            self.text.extend(content.chars().take(room));
            self.used_chars += sep_chars + room;
            self.memory_ids.push(id);
        }
        self.full = true;
        false
    }

    fn finish(self, chars_per_token: usize) -> ContextBundle {
        let used_tokens = self.used_chars.div_ceil(chars_per_token.max(1));
        ContextBundle {
            text: self.text,
            used_tokens,
            memory_ids: self.memory_ids,
        }
    }
}
