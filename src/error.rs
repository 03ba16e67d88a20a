//! Typed error kinds surfaced by the caller API.
//!
//! Background workers never crash on a single row; they record failures in
//! row metadata and keep going. These kinds are for the user-visible
//! operations, which fail fast with a stable short message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// Caller-side programming error. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Missing id or row.
    #[error("memory not found: {0}")]
    NotFound(i64),

    /// Backend I/O failure after the internal retry.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Embedding provider failure (network, 5xx, timeout).
    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Provider signalled overload (429). Workers back off and shed
    /// concurrency; the service surface reports it as unavailable.
    #[error("embedding provider overloaded: {0}")]
    Overloaded(String),

    /// LLM ranking provider failure.
    #[error("llm provider unavailable: {0}")]
    LlmUnavailable(String),
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        MemoryError::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::InvalidInput(format!("bad json: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
