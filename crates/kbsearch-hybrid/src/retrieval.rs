//! Concurrent dense + sparse retrieval over every query variant.

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;

use kbsearch_core::traits::{DenseIndex, EmbeddingProvider, LexicalIndex};
use kbsearch_core::types::{Channel, Degradations, QueryVariants, SearchFilter, SearchHit};
use kbsearch_core::{Error, Result};

use crate::fusion::RankedList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Both,
    SparseOnly,
}

#[derive(Debug, Default)]
pub struct RetrievalOutcome {
    pub lists: Vec<RankedList>,
    pub dense_failures: usize,
    pub sparse_failures: usize,
}

impl RetrievalOutcome {
    pub fn degradations(&self) -> Degradations {
        Degradations { dense: self.dense_failures > 0, sparse: self.sparse_failures > 0, ..Degradations::default() }
    }

    pub fn total_hits(&self) -> usize {
        self.lists.iter().map(|l| l.hits.len()).sum()
    }
}

type CallResult = (usize, Channel, anyhow::Result<Vec<SearchHit>>);

pub struct DualRetriever {
    dense: Arc<dyn DenseIndex>,
    lexical: Arc<dyn LexicalIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    per_call_timeout: Duration,
}

impl DualRetriever {
    pub fn new(
        dense: Arc<dyn DenseIndex>,
        lexical: Arc<dyn LexicalIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        per_call_timeout: Duration,
    ) -> Self {
        Self { dense, lexical, embedder, per_call_timeout }
    }

    /// Startup check: the provider must emit vectors the index can search.
    pub fn check_dimensions(&self) -> Result<()> {
        let (expected, actual) = (self.dense.dim(), self.embedder.dim());
        if expected != actual {
            return Err(Error::DimensionMismatch { expected, actual });
        }
        Ok(())
    }

    async fn timed<T>(&self, fut: impl std::future::Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
        match tokio::time::timeout(self.per_call_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(anyhow::anyhow!("timed out after {}ms", self.per_call_timeout.as_millis())),
        }
    }

    /// Embed every variant. A vector of the wrong length is fatal; any other
    /// failure drops the dense call for that variant.
    async fn embed_variants(&self, variants: &QueryVariants) -> Result<Vec<anyhow::Result<Vec<f32>>>> {
        let expected = self.dense.dim();
        let embedded = join_all(variants.iter().map(|v| self.timed(self.embedder.embed(&v.text)))).await;
        for vector in embedded.iter().flatten() {
            if vector.len() != expected {
                return Err(Error::DimensionMismatch { expected, actual: vector.len() });
            }
        }
        Ok(embedded)
    }

    pub async fn retrieve(&self, variants: &QueryVariants, k: usize, filter: &SearchFilter, mode: ChannelMode) -> Result<RetrievalOutcome> {
        let mut outcome = RetrievalOutcome::default();
        let mut calls: Vec<BoxFuture<'_, CallResult>> = Vec::new();

        if mode == ChannelMode::Both {
            let embedded = self.embed_variants(variants).await?;
            for (idx, vector) in embedded.into_iter().enumerate() {
                match vector {
                    Ok(vector) => calls.push(
                        async move { (idx, Channel::Dense, self.timed(self.dense.search(&vector, k, filter)).await) }.boxed(),
                    ),
                    Err(e) => {
                        tracing::warn!(stage = "retrieve", variant = idx, channel = "dense", error = %e, "embedding failed, dense call skipped");
                        outcome.dense_failures += 1;
                    }
                }
            }
        }
        for (idx, variant) in variants.iter().enumerate() {
            calls.push(async move { (idx, Channel::Sparse, self.timed(self.lexical.search(&variant.text, k, filter)).await) }.boxed());
        }

        let attempted = calls.len() + outcome.dense_failures;
        let variant_list: Vec<_> = variants.iter().collect();
        for (idx, channel, result) in join_all(calls).await {
            match result {
                Ok(hits) => {
                    outcome.lists.push(RankedList { variant: variant_list[idx].source, channel, hits });
                }
                Err(e) => {
                    tracing::warn!(stage = "retrieve", variant = idx, channel = ?channel, error = %e, "retrieval call failed");
                    match channel {
                        Channel::Dense => outcome.dense_failures += 1,
                        Channel::Sparse => outcome.sparse_failures += 1,
                    }
                }
            }
        }

        if outcome.lists.is_empty() && attempted > 0 {
            return Err(Error::RetrievalUnavailable(format!(
                "all {attempted} retrieval calls failed ({} dense, {} sparse)",
                outcome.dense_failures, outcome.sparse_failures
            )));
        }
        tracing::debug!(stage = "retrieve", lists = outcome.lists.len(), hits = outcome.total_hits(), "retrieval finished");
        Ok(outcome)
    }
}
