pub mod index;
pub mod store;
pub mod types;

use sha2::{Digest, Sha256};

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// SHA-256 of a chunk of content, hex-encoded. This is the `source_hash`
/// recorded next to each vector and the basis of staleness checks.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Cosine similarity recovered from a vec0 L2 distance.
///
/// Vectors are L2-normalized before insert, so d² = 2 − 2·cos.
pub fn l2_distance_to_cosine(distance: f64) -> f64 {
    1.0 - (distance * distance) / 2.0
}

/// L2-normalize a vector. Returns a zero vector if the input norm is zero.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

/// Split content into overlapping chunks of at most `chunk_max` characters.
///
/// Content at or under `chunk_max` comes back as a single chunk. Chunk
/// boundaries respect UTF-8 character boundaries; byte offsets are
/// approximate for multi-byte text but the overlap guarantee holds.
pub fn chunk_text(content: &str, chunk_max: usize, overlap: usize) -> Vec<String> {
    assert!(chunk_max > 0, "chunk_max must be positive");
    let overlap = overlap.min(chunk_max.saturating_sub(1));

    let chars: Vec<char> = content.chars().collect();
    if chars.len() <= chunk_max {
        return vec![content.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + chunk_max).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start = end - overlap;
    }
    chunks
}
