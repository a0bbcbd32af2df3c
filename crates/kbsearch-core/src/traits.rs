//! Collaborator contracts consumed by the retrieval pipeline.
//!
//! Every external dependency of a search request sits behind one of these
//! traits so that the pipeline can be driven by real stores (tantivy,
//! LanceDB, candle, HTTP scorers) or by in-memory fakes in tests.

use async_trait::async_trait;
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::types::{CacheEntry, Chunk, ScorerFamily, SearchFilter, SearchHit};

/// Approximate nearest-neighbour search over chunk embeddings.
#[async_trait]
pub trait DenseIndex: Send + Sync {
    /// Dimension of the stored vectors.
    fn dim(&self) -> usize;

    /// Top-`k` hits for `vector`, best first. Filters are applied before
    /// the similarity cut.
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> anyhow::Result<Vec<SearchHit>>;
}

/// Inverted-index keyword search.
#[async_trait]
pub trait LexicalIndex: Send + Sync {
    async fn search(
        &self,
        text: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> anyhow::Result<Vec<SearchHit>>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dim(&self) -> usize;

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }
}

/// Scores (query, passage) pairs; one score per passage, in input order.
#[async_trait]
pub trait PairwiseReranker: Send + Sync {
    fn family(&self) -> ScorerFamily;

    async fn score(&self, query: &str, passages: &[String]) -> anyhow::Result<Vec<f32>>;
}

/// Best-effort query paraphrasing.
#[async_trait]
pub trait TextRewriter: Send + Sync {
    async fn rewrite(&self, text: &str) -> anyhow::Result<String>;
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Chunk>>;

    /// Chunks of `document_id` whose position lies in `positions`, in position order.
    async fn get_neighbors(
        &self,
        document_id: &str,
        positions: RangeInclusive<u32>,
    ) -> anyhow::Result<Vec<Chunk>>;
}

/// Second, shared tier of the response cache.
#[async_trait]
pub trait CacheBackingStore: Send + Sync {
    async fn get(&self, fingerprint: &str) -> anyhow::Result<Option<CacheEntry>>;

    async fn set(&self, fingerprint: &str, entry: &CacheEntry, ttl: Duration) -> anyhow::Result<()>;
}
