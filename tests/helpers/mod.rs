#![allow(dead_code)]

use archivist::db;
use archivist::error::{MemoryError, Result};
use archivist::memory::l2_normalize;
use archivist::provider::{EmbeddingProvider, LlmProvider};
use rusqlite::Connection;
use std::sync::atomic::{AtomicBool, Ordering};

/// Dimension used across integration tests. Small on purpose.
pub const DIM: usize = 8;

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Connection {
    db::open_memory_database(DIM).unwrap()
}

/// Insert a plain test memory. Returns the memory id.
pub fn insert_memory(conn: &Connection, content: &str, namespace: &str) -> i64 {
    archivist::memory::store::insert_memory(conn, "tester", Some(content), "general", namespace, None)
        .unwrap()
}

/// Deterministic bag-of-words embedding: each word contributes a spike at a
/// position derived from its bytes, then the vector is L2-normalized. Texts
/// sharing words land close together ("hello" vs "hello world"), disjoint
/// texts land far apart.
pub struct BagEmbedding {
    pub fail: AtomicBool,
}

impl BagEmbedding {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
        }
    }
}

impl EmbeddingProvider for BagEmbedding {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MemoryError::EmbeddingUnavailable("mock offline".into()));
        }
        let mut v = vec![0.0f32; DIM];
        for word in text.split_whitespace() {
            let spike = word.bytes().map(|b| b as usize).sum::<usize>() % DIM;
            v[spike] += 1.0;
        }
        if v.iter().all(|x| *x == 0.0) {
            v[0] = 1.0;
        }
        Ok(l2_normalize(&v))
    }

    fn dimensions(&self) -> usize {
        DIM
    }

    fn health(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(MemoryError::EmbeddingUnavailable("mock offline".into()))
        } else {
            Ok(())
        }
    }
}

/// Keyword-driven ranking mock: constitutions are critical, timestamps are
/// trivial, everything else lands in the middle.
pub struct KeywordLlm {
    pub fail: AtomicBool,
}

impl KeywordLlm {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
        }
    }
}

impl LlmProvider for KeywordLlm {
    fn complete(&self, prompt: &str, _temperature: f64, _max_tokens: u32) -> Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MemoryError::LlmUnavailable("mock offline".into()));
        }
        let lower = prompt.to_lowercase();
        if lower.contains("memory: constitution") {
            Ok("1".into())
        } else if lower.contains("memory: timestamp") {
            Ok("5".into())
        } else {
            Ok("3".into())
        }
    }
}
