//! Ollama-backed providers.
//!
//! Talks to a local Ollama daemon over its HTTP API: `/api/embeddings` for
//! vectors, `/api/generate` for single-shot completions. Responses are
//! L2-normalized before they leave the embedding provider, so downstream
//! cosine math can rely on unit vectors.

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use crate::config::{EmbeddingConfig, RankerConfig};
use crate::error::{MemoryError, Result};
use crate::memory::l2_normalize;
use crate::provider::{EmbeddingProvider, LlmProvider};

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

pub struct OllamaEmbedding {
    client: Client,
    base_url: String,
    model: String,
    dimensions: usize,
    max_input_chars: usize,
}

impl OllamaEmbedding {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_s))
            .build()
            .map_err(|e| MemoryError::EmbeddingUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimensions: config.dimensions,
            max_input_chars: config.max_input_chars,
        })
    }
}

impl EmbeddingProvider for OllamaEmbedding {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let char_count = text.chars().count();
        if char_count > self.max_input_chars {
            return Err(MemoryError::InvalidInput(format!(
                "input of {char_count} chars exceeds embedding limit of {}",
                self.max_input_chars
            )));
        }

        let resp = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": text,
            }))
            .send()
            .map_err(|e| MemoryError::EmbeddingUnavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(status_to_error(status, &body));
        }

        let parsed: EmbeddingResponse = resp
            .json()
            .map_err(|e| MemoryError::EmbeddingUnavailable(format!("bad response: {e}")))?;

        if parsed.embedding.len() != self.dimensions {
            return Err(MemoryError::EmbeddingUnavailable(format!(
                "model {} returned {} dimensions, expected {}",
                self.model,
                parsed.embedding.len(),
                self.dimensions
            )));
        }

        Ok(l2_normalize(&parsed.embedding))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_input_chars(&self) -> usize {
        self.max_input_chars
    }

    fn health(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .map_err(|e| MemoryError::EmbeddingUnavailable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(MemoryError::EmbeddingUnavailable(format!(
                "ollama returned {}",
                resp.status()
            )))
        }
    }
}

fn status_to_error(status: StatusCode, body: &str) -> MemoryError {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            MemoryError::Overloaded(format!("ollama returned {status}"))
        }
        s if s.is_client_error() => {
            MemoryError::InvalidInput(format!("embedding request rejected ({s}): {body}"))
        }
        s => MemoryError::EmbeddingUnavailable(format!("ollama returned {s}: {body}")),
    }
}

pub struct OllamaLlm {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaLlm {
    pub fn new(config: &RankerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_s))
            .build()
            .map_err(|e| MemoryError::LlmUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

impl LlmProvider for OllamaLlm {
    fn complete(&self, prompt: &str, temperature: f64, max_tokens: u32) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
                "options": {
                    "temperature": temperature,
                    "num_predict": max_tokens,
                },
            }))
            .send()
            .map_err(|e| MemoryError::LlmUnavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(MemoryError::LlmUnavailable(format!(
                "ollama returned {status}: {body}"
            )));
        }

        let parsed: GenerateResponse = resp
            .json()
            .map_err(|e| MemoryError::LlmUnavailable(format!("bad response: {e}")))?;
        Ok(parsed.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_statuses_map_to_overloaded() {
        assert!(matches!(
            status_to_error(StatusCode::TOO_MANY_REQUESTS, ""),
            MemoryError::Overloaded(_)
        ));
        assert!(matches!(
            status_to_error(StatusCode::SERVICE_UNAVAILABLE, ""),
            MemoryError::Overloaded(_)
        ));
    }

    #[test]
    fn client_errors_map_to_invalid_input() {
        assert!(matches!(
            status_to_error(StatusCode::BAD_REQUEST, "no such model"),
            MemoryError::InvalidInput(_)
        ));
    }

    #[test]
    fn server_errors_map_to_unavailable() {
        assert!(matches!(
            status_to_error(StatusCode::INTERNAL_SERVER_ERROR, ""),
            MemoryError::EmbeddingUnavailable(_)
        ));
    }

    #[test]
    fn oversize_input_rejected_before_request() {
        let config = EmbeddingConfig {
            max_input_chars: 10,
            ..Default::default()
        };
        let provider = OllamaEmbedding::new(&config).unwrap();
        let res = provider.embed(&"x".repeat(11));
        assert!(matches!(res, Err(MemoryError::InvalidInput(_))));
    }
}
