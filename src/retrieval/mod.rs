//! Document retrieval
//!
//! Ranks a session's chunks against a query. Retrieval is advisory: an empty
//! index yields an empty result, never an error.

pub mod embedding;
pub mod index;

pub use embedding::{cosine_similarity, Embedder, HashingEmbedder, EMBEDDING_DIM};
pub use index::{Chunk, DocumentIndex, DocumentRecord};

use crate::config::MAX_RETRIEVAL_K;
use crate::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Arc<Chunk>,
    pub score: f32,
}

/// Top-`k` chunks for a query vector, highest similarity first.
///
/// Ties are broken by the chunk's `sequence_index`, then by insertion order,
/// so repeated calls return the same ordering.
pub fn rank(index: &DocumentIndex, query_vector: &[f32], k: usize) -> Vec<ScoredChunk> {
    let k = k.min(MAX_RETRIEVAL_K);
    if k == 0 || index.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(usize, ScoredChunk)> = index
        .chunks()
        .iter()
        .enumerate()
        .map(|(position, chunk)| {
            let score = cosine_similarity(query_vector, &chunk.embedding);
            (
                position,
                ScoredChunk {
                    chunk: Arc::clone(chunk),
                    score,
                },
            )
        })
        .collect();

    scored.sort_by(|(pos_a, a), (pos_b, b)| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.sequence_index.cmp(&b.chunk.sequence_index))
            .then_with(|| pos_a.cmp(pos_b))
    });
    scored.truncate(k);
    scored.into_iter().map(|(_, s)| s).collect()
}

/// Embeds queries and ranks them against an index.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    top_k: usize,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, top_k: usize) -> Self {
        Self {
            embedder,
            top_k: top_k.clamp(1, MAX_RETRIEVAL_K),
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Rank `index` against `query_text`, returning at most `k` chunks.
    pub fn retrieve(
        &self,
        index: &DocumentIndex,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        if index.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed(query_text)?;
        let results = rank(index, &query, k);
        debug!(
            chunks = index.len(),
            returned = results.len(),
            best = results.first().map(|r| r.score).unwrap_or_default(),
            "Retrieved document context"
        );
        Ok(results)
    }

    /// [`Retriever::retrieve`] with the configured `top_k`.
    pub fn retrieve_default(&self, index: &DocumentIndex, query_text: &str) -> Result<Vec<ScoredChunk>> {
        self.retrieve(index, query_text, self.top_k)
    }
}
