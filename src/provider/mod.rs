//! Model providers: text-to-vector embedding and LLM completion.
//!
//! Provides the [`EmbeddingProvider`] and [`LlmProvider`] traits and an
//! Ollama-backed implementation of each. Providers are created via
//! [`create_embedding_provider`] / [`create_llm_provider`] from configuration.
//! All methods are synchronous — callers in async contexts use
//! `tokio::task::spawn_blocking`.

pub mod ollama;

use std::sync::Arc;

use crate::config::{EmbeddingConfig, RankerConfig};
use crate::error::{MemoryError, Result};

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly
/// [`dimensions`](EmbeddingProvider::dimensions) width. A backend that is
/// temporarily shedding load returns [`MemoryError::Overloaded`], which the
/// librarian treats as a backpressure signal rather than a failure.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Number of dimensions this provider produces.
    fn dimensions(&self) -> usize;

    /// Largest input the backend accepts, in characters. Callers skip inputs
    /// beyond this instead of sending a doomed request.
    fn max_input_chars(&self) -> usize {
        usize::MAX
    }

    /// Cheap reachability check for the health surface.
    fn health(&self) -> Result<()>;
}

/// Trait for single-shot LLM completions (used by the ranker).
pub trait LlmProvider: Send + Sync {
    /// Complete a prompt, returning the raw response text.
    fn complete(&self, prompt: &str, temperature: f64, max_tokens: u32) -> Result<String>;
}

/// Create an embedding provider from config. Only `"ollama"` is supported.
pub fn create_embedding_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(ollama::OllamaEmbedding::new(config)?)),
        other => Err(MemoryError::InvalidInput(format!(
            "unknown embedding provider: {other}. Supported: ollama"
        ))),
    }
}

/// Create an LLM provider from ranker config.
pub fn create_llm_provider(config: &RankerConfig) -> Result<Arc<dyn LlmProvider>> {
    Ok(Arc::new(ollama::OllamaLlm::new(config)?))
}
