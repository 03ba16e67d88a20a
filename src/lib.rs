//! Durable memory for AI agents — a store, a vector index, and the workers
//! that keep them in step.
//!
//! Archivist keeps an agent's memories in SQLite and maintains a derived
//! embedding index over them for semantic recall. Namespaces group memories
//! for priority retrieval; an LLM-backed ranker attaches an importance score
//! (`sentiment_level`, 1 = critical, 5 = minimal) used as a tie-breaker.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with [sqlite-vec](https://github.com/asg017/sqlite-vec)
//!   for vector search; the store is the single source of truth and the
//!   index is rebuildable from it
//! - **Embeddings**: Ollama over HTTP (nomic-embed-text by default),
//!   L2-normalized vectors
//! - **Librarian**: background vectorizer — at-least-once, idempotent,
//!   poison-safe
//! - **Failover**: optional primary/local store pair selected by a TCP
//!   presence probe, with a one-way tail sync
//!
//! # Modules
//!
//! - [`config`] — Configuration loading from TOML files and environment variables
//! - [`db`] — SQLite initialization, schema, and migrations
//! - [`memory`] — Store, embedding index, and shared text/vector helpers
//! - [`provider`] — Embedding and LLM providers (Ollama)
//! - [`librarian`] — The background vectorizer
//! - [`retriever`] — Token-budgeted context assembly
//! - [`ranker`] — LLM importance ranking
//! - [`failover`] — Presence probe, endpoint selection, and sync
//! - [`service`] — The caller-facing API surface

pub mod config;
pub mod db;
pub mod error;
pub mod failover;
pub mod librarian;
pub mod memory;
pub mod provider;
pub mod ranker;
pub mod retriever;
pub mod service;
