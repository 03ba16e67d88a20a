//! The caller-facing API surface.
//!
//! [`MemoryService`] binds a store (after endpoint selection), holds the
//! embedding provider, and exposes the operations the CLI and any other
//! glue call. Background workers (librarian, ranker) are constructed
//! separately and share the service's connection.

use anyhow::Context as _;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::config::ArchivistConfig;
use crate::error::{MemoryError, Result};
use crate::failover::{self, StoreRole};
use crate::memory::types::{ListFilter, MemoryRecord};
use crate::memory::{index, store};
use crate::provider::{self, EmbeddingProvider, LlmProvider};
use crate::ranker::{RankReport, Ranker};
use crate::retriever::{self, ContextBundle};

/// Context assembly mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    Priority,
    Semantic,
}

impl std::str::FromStr for ContextMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "priority" => Ok(Self::Priority),
            "semantic" => Ok(Self::Semantic),
            _ => Err(format!("unknown context mode: {s}")),
        }
    }
}

/// Aggregated health of the three planes plus the freshness SLO reading.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub store: bool,
    pub index: bool,
    pub provider: bool,
    pub role: String,
    pub lag_p90_s: Option<f64>,
    pub total_memories: i64,
    pub vector_entries: i64,
}

pub struct MemoryService {
    conn: Arc<Mutex<Connection>>,
    embedding: Arc<dyn EmbeddingProvider>,
    config: ArchivistConfig,
    role: StoreRole,
}

impl MemoryService {
    /// Probe, select an endpoint, open the database, and wire the embedding
    /// provider.
    pub fn open(config: ArchivistConfig) -> anyhow::Result<Self> {
        let selected = failover::select_store(&config.storage);
        let conn = crate::db::open_database(&selected.path, config.embedding.dimensions)
            .with_context(|| format!("failed to open {} store", selected.role))?;
        crate::db::check_embedding_model(&conn, &config.embedding.model)
            .context("failed to check embedding model pin")?;
        let embedding = provider::create_embedding_provider(&config.embedding)
            .context("failed to create embedding provider")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            embedding,
            config,
            role: selected.role,
        })
    }

    /// Assemble a service from existing parts. Used by tests and by callers
    /// that manage their own connection.
    pub fn from_parts(
        conn: Arc<Mutex<Connection>>,
        embedding: Arc<dyn EmbeddingProvider>,
        config: ArchivistConfig,
        role: StoreRole,
    ) -> Self {
        Self {
            conn,
            embedding,
            config,
            role,
        }
    }

    /// Shared connection handle, for wiring background workers.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    pub fn embedding_provider(&self) -> Arc<dyn EmbeddingProvider> {
        Arc::clone(&self.embedding)
    }

    pub fn config(&self) -> &ArchivistConfig {
        &self.config
    }

    pub fn role(&self) -> StoreRole {
        self.role
    }

    /// Store a memory. `user_id` overrides the configured tenant for this
    /// row only.
    pub fn add_memory(
        &self,
        user_id: Option<&str>,
        content: &str,
        namespace: Option<&str>,
        memory_type: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        store::insert_memory(
            &conn,
            user_id.unwrap_or(&self.config.general.user_id),
            Some(content),
            memory_type.unwrap_or("general"),
            namespace.unwrap_or("imported"),
            metadata,
        )
    }

    pub fn get_memory(&self, id: i64) -> Result<MemoryRecord> {
        let conn = self.conn.lock().expect("store lock poisoned");
        store::get_memory(&conn, id)
    }

    pub fn list_memories(&self, filter: &ListFilter) -> Result<Vec<MemoryRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        store::list_memories(&conn, filter)
    }

    /// Semantic search. The query is embedded before the store lock is
    /// taken, so a slow model never stalls writers.
    pub fn search_memories(
        &self,
        query: &str,
        k: usize,
        namespaces: Option<&[String]>,
    ) -> Result<Vec<(MemoryRecord, f64)>> {
        let query_vector = self.embedding.embed(query)?;
        let conn = self.conn.lock().expect("store lock poisoned");
        retriever::search_ranked(&conn, &query_vector, k, namespaces)
    }

    /// Assemble a context bundle. Semantic mode needs a query; when the
    /// embedding provider is down, it degrades to priority mode instead of
    /// failing the call.
    pub fn load_context(
        &self,
        budget_tokens: Option<usize>,
        mode: ContextMode,
        query: Option<&str>,
    ) -> Result<ContextBundle> {
        match mode {
            ContextMode::Priority => {
                let conn = self.conn.lock().expect("store lock poisoned");
                retriever::load_priority_context(&conn, &self.config.retrieval, budget_tokens)
            }
            ContextMode::Semantic => {
                let query = query.ok_or_else(|| {
                    MemoryError::InvalidInput("semantic mode requires a query".into())
                })?;
                // Embed first, lock after.
                match self.embedding.embed(query) {
                    Ok(query_vector) => {
                        let conn = self.conn.lock().expect("store lock poisoned");
                        retriever::load_semantic_context(
                            &conn,
                            &self.config.retrieval,
                            &query_vector,
                            budget_tokens,
                            None,
                        )
                    }
                    Err(MemoryError::EmbeddingUnavailable(msg))
                    | Err(MemoryError::Overloaded(msg)) => {
                        warn!(%msg, "semantic context unavailable, falling back to priority mode");
                        let conn = self.conn.lock().expect("store lock poisoned");
                        retriever::load_priority_context(
                            &conn,
                            &self.config.retrieval,
                            budget_tokens,
                        )
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Rank up to `max_rows` unranked memories with the given LLM provider.
    /// Callers needing progress reporting or re-rank control use [`Ranker`]
    /// directly.
    pub fn rank_unranked(&self, llm: Arc<dyn LlmProvider>, max_rows: usize) -> Result<RankReport> {
        let ranker = Ranker::new(self.connection(), llm, self.config.ranker.clone());
        ranker.rank_unranked(max_rows, |_| {})
    }

    /// Soft-delete by default; `hard` removes the row and its vectors.
    pub fn forget(&self, id: i64, hard: bool) -> Result<()> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        if hard {
            store::hard_delete(&mut conn, id)
        } else {
            store::tombstone(&conn, id)
        }
    }

    pub fn update_content(&self, id: i64, new_content: &str) -> Result<()> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        store::update_content(&mut conn, id, new_content)
    }

    pub fn purge_orphans(&self) -> Result<usize> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        index::purge_orphans(&mut conn)
    }

    pub fn health(&self) -> HealthReport {
        let conn = self.conn.lock().expect("store lock poisoned");
        let total = store::total_count(&conn);
        let entries = index::entry_count(&conn);
        let lag = index::freshness_lag_p90(&conn).ok().flatten();
        drop(conn);

        HealthReport {
            store: total.is_ok(),
            index: entries.is_ok(),
            provider: self.embedding.health().is_ok(),
            role: self.role.to_string(),
            lag_p90_s: lag,
            total_memories: total.unwrap_or(0),
            vector_entries: entries.unwrap_or(0),
        }
    }

    pub fn count_by_namespace(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        store::count_by_namespace(&conn)
    }
}
