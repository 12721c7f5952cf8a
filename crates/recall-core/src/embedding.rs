//! Deterministic, model-free text embeddings and hashing helpers.
//!
//! Every lowercase alphanumeric token is hashed with SHA-256; the first four
//! digest bytes pick a dimension and the fifth byte picks the sign. The
//! accumulated vector is L2-normalized, so identical text always yields an
//! identical vector.

use sha2::{Digest, Sha256};

/// Default embedding dimension.
pub const DEFAULT_DIMENSIONS: usize = 64;

/// Split text into lowercase `[a-z0-9]+` runs.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit()))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Generate a deterministic embedding for `text`.
///
/// Text with no tokens yields the zero vector.
pub fn embed_text(text: &str, dimensions: usize) -> Vec<f32> {
    let dims = dimensions.max(1);
    let mut vector = vec![0.0f32; dims];

    for token in tokenize(text) {
        let digest = Sha256::digest(token.as_bytes());
        let index = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize % dims;
        let sign = if digest[4] % 2 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector;
    }
    vector.iter().map(|v| v / norm).collect()
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 when lengths differ or either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Collapse runs of whitespace and trim, the form chunks are deduplicated on.
pub fn normalize_content(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// SHA-256 hex digest of the normalized content.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(normalize_content(content).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Redis needs REDIS_MAX_CONNECTIONS=10!"),
            vec!["redis", "needs", "redis", "max", "connections", "10"]
        );
        assert!(tokenize("  --  ").is_empty());
    }

    #[test]
    fn test_embedding_is_deterministic() {
        let a = embed_text("connection pool exhausted", DEFAULT_DIMENSIONS);
        let b = embed_text("connection pool exhausted", DEFAULT_DIMENSIONS);
        assert_eq!(a.len(), DEFAULT_DIMENSIONS);
        assert_eq!(
            a.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            b.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let v = embed_text("", 16);
        assert_eq!(v.len(), 16);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_embedding_is_normalized() {
        let v = embed_text("alpha beta gamma delta", 32);
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 0.001);

        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_content_hash_normalizes_whitespace() {
        assert_eq!(content_hash("use  WAL\n mode "), content_hash("use WAL mode"));
        assert_ne!(content_hash("use WAL mode"), content_hash("use wal mode"));
        assert_eq!(content_hash("x").len(), 64);
    }
}
