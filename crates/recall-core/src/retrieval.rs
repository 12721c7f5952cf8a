//! Chunk retrieval: full-text, hybrid fusion and optional reranking.
//!
//! Hybrid search runs two arms and combines them with Reciprocal Rank Fusion:
//!
//! - the full-text arm asks storage for `4 × pool` candidates;
//! - the vector arm scores every embedded chunk against a query embedding of
//!   the same dimension as the oldest embedded chunk.
//!
//! Each arm ranks from 1 with ascending-id tie-breaks, and a chunk's fusion
//! score is `Σ 1 / (k + rank)` over the arms it appears in.

use crate::config::RetrievalConfig;
use crate::embedding::{cosine_similarity, embed_text, tokenize};
use crate::error::{Error, Result};
use crate::models::{Chunk, SemanticLabel};
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Weight of the embedding similarity in the rerank score.
const RERANK_SIMILARITY_WEIGHT: f64 = 0.75;

/// Bonus when the whole query appears verbatim in the chunk.
const RERANK_SUBSTRING_BONUS: f64 = 0.15;

/// Full-text candidates fetched per requested result in hybrid mode.
const HYBRID_FTS_MULTIPLIER: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalBackend {
    #[default]
    Fts,
    Hybrid,
}

impl FromStr for RetrievalBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fts" | "fts5" => Ok(Self::Fts),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(Error::validation(format!("unknown retrieval backend: {other}"))),
        }
    }
}

impl fmt::Display for RetrievalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fts => f.write_str("fts"),
            Self::Hybrid => f.write_str("hybrid"),
        }
    }
}

/// Per-call overrides; unset fields fall back to [`RetrievalConfig`].
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub top_k: Option<usize>,
    pub labels: Option<Vec<SemanticLabel>>,
    pub backend: Option<RetrievalBackend>,
    pub rerank: Option<bool>,
}

impl SearchOptions {
    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn labels(mut self, labels: Vec<SemanticLabel>) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn backend(mut self, backend: RetrievalBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn rerank(mut self, rerank: bool) -> Self {
        self.rerank = Some(rerank);
        self
    }
}

/// A retrieved chunk with the scores that placed it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// 1-based position in the full-text arm
    pub fts_rank: Option<usize>,
    /// 1-based position in the vector arm
    pub vector_rank: Option<usize>,
    pub similarity: Option<f32>,
    pub fusion_score: f64,
    pub rerank_score: Option<f64>,
}

impl ScoredChunk {
    fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            fts_rank: None,
            vector_rank: None,
            similarity: None,
            fusion_score: 0.0,
            rerank_score: None,
        }
    }

    fn similarity_key(&self) -> f32 {
        self.similarity.unwrap_or(f32::NEG_INFINITY)
    }
}

pub struct Retriever {
    storage: Arc<dyn Storage>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(storage: Arc<dyn Storage>, config: RetrievalConfig) -> Self {
        Self { storage, config }
    }

    fn default_backend(&self) -> RetrievalBackend {
        self.config.backend.parse().unwrap_or_else(|_| {
            warn!(backend = %self.config.backend, "Unknown retrieval backend, using fts");
            RetrievalBackend::Fts
        })
    }

    /// Search chunks, returning at most `top_k` results best first.
    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<Vec<ScoredChunk>> {
        let top_k = options.top_k.unwrap_or(self.config.top_k).max(1);
        let backend = options.backend.unwrap_or_else(|| self.default_backend());
        let rerank_enabled = options.rerank.unwrap_or(self.config.rerank_enabled);
        let pool = if rerank_enabled {
            top_k.max(self.config.rerank_candidate_k)
        } else {
            top_k
        };

        let mut candidates = match backend {
            RetrievalBackend::Fts => self.fts_candidates(query, pool).await?,
            RetrievalBackend::Hybrid => self.hybrid_candidates(query, pool).await?,
        };

        if let Some(labels) = options.labels.as_deref().filter(|l| !l.is_empty()) {
            candidates.retain(|c| labels.contains(&c.chunk.label));
        }

        if rerank_enabled {
            candidates = rerank(query, candidates);
        }

        candidates.truncate(top_k);
        debug!(
            %backend,
            rerank = rerank_enabled,
            results = candidates.len(),
            "Retrieval complete"
        );
        Ok(candidates)
    }

    /// Convenience wrapper returning only the chunks.
    pub async fn search_chunks(&self, query: &str, top_k: usize) -> Result<Vec<Chunk>> {
        let results = self.search(query, SearchOptions::default().top_k(top_k)).await?;
        Ok(results.into_iter().map(|r| r.chunk).collect())
    }

    async fn fts_candidates(&self, query: &str, limit: usize) -> Result<Vec<ScoredChunk>> {
        let hits = self.storage.search_chunks_fts(query, limit).await?;
        let k = self.config.fusion_k as f64;
        Ok(hits
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let rank = index + 1;
                let mut scored = ScoredChunk::new(chunk);
                scored.fts_rank = Some(rank);
                scored.fusion_score = 1.0 / (k + rank as f64);
                scored
            })
            .collect())
    }

    async fn hybrid_candidates(&self, query: &str, pool: usize) -> Result<Vec<ScoredChunk>> {
        let fts_limit = pool.max(pool.saturating_mul(HYBRID_FTS_MULTIPLIER));
        let fts_hits = self.storage.search_chunks_fts(query, fts_limit).await?;

        let embedded = match self.storage.list_chunks_with_embeddings().await {
            Ok(chunks) => chunks,
            Err(err) => {
                warn!(error = %err, "Embedding lookup failed, using full-text results only");
                Vec::new()
            }
        };

        let vector_hits = score_by_similarity(query, embedded);
        Ok(fuse(fts_hits, vector_hits, self.config.fusion_k))
    }
}

/// Score embedded chunks against the query.
///
/// The dimension comes from the first chunk (oldest, as listed by storage).
/// Every chunk of that dimension is ranked, whatever its similarity; chunks
/// of another dimension are left out.
fn score_by_similarity(query: &str, embedded: Vec<Chunk>) -> Vec<(Chunk, f32)> {
    let Some(dims) = embedded
        .iter()
        .find_map(|c| c.embedding.as_ref().map(Vec::len))
        .filter(|d| *d > 0)
    else {
        return Vec::new();
    };

    let query_vector = embed_text(query, dims);
    let mut scored: Vec<(Chunk, f32)> = embedded
        .into_iter()
        .filter_map(|chunk| {
            let similarity = match chunk.embedding.as_deref() {
                Some(vector) if vector.len() == dims => cosine_similarity(&query_vector, vector),
                _ => return None,
            };
            Some((chunk, similarity))
        })
        .collect();

    scored.sort_by(|(a, sa), (b, sb)| sb.total_cmp(sa).then_with(|| a.id.cmp(&b.id)));
    scored
}

/// Reciprocal Rank Fusion of the full-text and vector arms.
fn fuse(fts_hits: Vec<Chunk>, vector_hits: Vec<(Chunk, f32)>, fusion_k: usize) -> Vec<ScoredChunk> {
    let k = fusion_k as f64;
    let mut by_id: HashMap<Uuid, ScoredChunk> = HashMap::new();

    for (index, chunk) in fts_hits.into_iter().enumerate() {
        let rank = index + 1;
        let entry = by_id
            .entry(chunk.id)
            .or_insert_with(|| ScoredChunk::new(chunk));
        entry.fts_rank = Some(rank);
        entry.fusion_score += 1.0 / (k + rank as f64);
    }

    for (index, (chunk, similarity)) in vector_hits.into_iter().enumerate() {
        let rank = index + 1;
        let entry = by_id
            .entry(chunk.id)
            .or_insert_with(|| ScoredChunk::new(chunk));
        entry.vector_rank = Some(rank);
        entry.similarity = Some(similarity);
        entry.fusion_score += 1.0 / (k + rank as f64);
    }

    let mut fused: Vec<ScoredChunk> = by_id.into_values().collect();
    fused.sort_by(|a, b| {
        b.fusion_score
            .total_cmp(&a.fusion_score)
            .then_with(|| b.similarity_key().total_cmp(&a.similarity_key()))
            .then_with(|| {
                a.fts_rank
                    .unwrap_or(usize::MAX)
                    .cmp(&b.fts_rank.unwrap_or(usize::MAX))
            })
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    fused
}

/// Second-stage scoring: lexical overlap plus weighted embedding similarity.
fn rerank(query: &str, candidates: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
    let query_terms: BTreeSet<String> = tokenize(query).into_iter().collect();
    let query_lower = query.trim().to_lowercase();

    let mut scored: Vec<(usize, f64, ScoredChunk)> = candidates
        .into_iter()
        .enumerate()
        .map(|(index, mut candidate)| {
            let text = candidate.chunk.searchable_text();
            let chunk_terms: BTreeSet<String> = tokenize(&text).into_iter().collect();

            let mut lexical = if query_terms.is_empty() {
                0.0
            } else {
                query_terms.intersection(&chunk_terms).count() as f64 / query_terms.len() as f64
            };
            if !query_lower.is_empty() && text.to_lowercase().contains(&query_lower) {
                lexical += RERANK_SUBSTRING_BONUS;
            }

            let similarity = candidate.similarity.or_else(|| {
                candidate.chunk.embedding.as_deref().map(|vector| {
                    cosine_similarity(&embed_text(query, vector.len()), vector)
                })
            });
            candidate.similarity = similarity;

            let score =
                lexical + RERANK_SIMILARITY_WEIGHT * f64::from(similarity.unwrap_or(0.0).max(0.0));
            candidate.rerank_score = Some(score);
            (index, lexical, candidate)
        })
        .collect();

    scored.sort_by(|(ia, la, a), (ib, lb, b)| {
        let score = |c: &ScoredChunk| c.rerank_score.unwrap_or(0.0);
        score(b)
            .total_cmp(&score(a))
            .then_with(|| b.similarity_key().total_cmp(&a.similarity_key()))
            .then_with(|| lb.partial_cmp(la).unwrap_or(Ordering::Equal))
            .then_with(|| ia.cmp(ib))
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });

    scored.into_iter().map(|(_, _, candidate)| candidate).collect()
}
