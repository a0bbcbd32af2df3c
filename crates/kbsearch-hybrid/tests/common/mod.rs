//! In-memory collaborators for driving the pipeline without real stores.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kbsearch_core::config::SearchSettings;
use kbsearch_core::text::tokens;
use kbsearch_core::traits::{CacheBackingStore, ChunkStore, DenseIndex, EmbeddingProvider, LexicalIndex, PairwiseReranker, TextRewriter};
use kbsearch_core::types::{CacheEntry, Channel, Chunk, ChunkMetadata, ScorerFamily, SearchFilter, SearchHit};
use kbsearch_hybrid::{HybridSearchEngine, RetrievalContext};

pub const DIM: usize = 8;

pub fn chunk(id: &str, document: &str, position: u32, text: &str) -> Chunk {
    Chunk {
        id: id.to_string(),
        document_id: document.to_string(),
        space: "ENG".to_string(),
        path: vec!["Runbooks".to_string()],
        position,
        text: text.to_string(),
        token_count: 0,
        metadata: ChunkMetadata::default(),
    }
}

pub fn corpus() -> Vec<Chunk> {
    vec![
        chunk("A", "doc-a", 0, "The deploy process starts with a tagged release build."),
        chunk("B", "doc-b", 0, "Deploy process checklist: approvals, canary, full rollout."),
        chunk("C", "doc-c", 0, "Rollback steps when a deploy goes wrong in production."),
        chunk("D", "doc-d", 0, "Process owners sign off every production change window."),
    ]
}

#[derive(Default)]
pub struct MemoryChunks {
    chunks: HashMap<String, Chunk>,
    pub gets: AtomicUsize,
    pub fail: bool,
}

impl MemoryChunks {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self { chunks: chunks.into_iter().map(|c| (c.id.clone(), c)).collect(), ..Self::default() }
    }
}

#[async_trait]
impl ChunkStore for MemoryChunks {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Chunk>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("chunk store down");
        }
        Ok(self.chunks.get(id).cloned())
    }

    async fn get_neighbors(&self, document_id: &str, positions: RangeInclusive<u32>) -> anyhow::Result<Vec<Chunk>> {
        let mut out: Vec<Chunk> = self
            .chunks
            .values()
            .filter(|c| c.document_id == document_id && positions.contains(&c.position))
            .cloned()
            .collect();
        out.sort_by_key(|c| c.position);
        Ok(out)
    }
}

/// Returns the same ranked ids for every call.
pub struct ScriptedIndex {
    ids: Vec<String>,
    channel: Channel,
    pub calls: AtomicUsize,
    pub fail: bool,
    pub filters: Mutex<Vec<SearchFilter>>,
    pub pool_sizes: Mutex<Vec<usize>>,
}

impl ScriptedIndex {
    pub fn new(channel: Channel, ids: &[&str]) -> Self {
        Self { ids: ids.iter().map(|s| s.to_string()).collect(), channel, calls: AtomicUsize::new(0), fail: false, filters: Mutex::new(Vec::new()), pool_sizes: Mutex::new(Vec::new()) }
    }

    pub fn failing(channel: Channel) -> Self {
        Self { fail: true, ..Self::new(channel, &[]) }
    }

    fn hits(&self, k: usize, filter: &SearchFilter) -> anyhow::Result<Vec<SearchHit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.filters.lock().unwrap().push(filter.clone());
        self.pool_sizes.lock().unwrap().push(k);
        if self.fail {
            anyhow::bail!("{:?} index unreachable", self.channel);
        }
        Ok(self
            .ids
            .iter()
            .take(k)
            .enumerate()
            .map(|(i, id)| SearchHit { id: id.clone(), score: 1.0 / (i as f32 + 1.0), source: self.channel })
            .collect())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DenseIndex for ScriptedIndex {
    fn dim(&self) -> usize {
        DIM
    }

    async fn search(&self, _vector: &[f32], k: usize, filter: &SearchFilter) -> anyhow::Result<Vec<SearchHit>> {
        self.hits(k, filter)
    }
}

#[async_trait]
impl LexicalIndex for ScriptedIndex {
    async fn search(&self, _text: &str, k: usize, filter: &SearchFilter) -> anyhow::Result<Vec<SearchHit>> {
        self.hits(k, filter)
    }
}

/// Bag-of-words vectors over a tiny fixed vocabulary.
pub struct CountingEmbedder {
    pub dim: usize,
    pub calls: AtomicUsize,
}

impl CountingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim, calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut v = vec![0.0; self.dim];
        for t in tokens(text) {
            let slot = t.bytes().map(usize::from).sum::<usize>() % self.dim;
            v[slot] += 1.0;
        }
        v[0] += 0.01;
        Ok(v)
    }
}

/// Scores every passage with a constant, optionally after a delay.
pub struct ConstantReranker {
    pub score: f32,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl ConstantReranker {
    pub fn new(score: f32) -> Self {
        Self { score, delay: Duration::ZERO, calls: AtomicUsize::new(0) }
    }

    pub fn slow(delay: Duration) -> Self {
        Self { delay, ..Self::new(1.0) }
    }
}

#[async_trait]
impl PairwiseReranker for ConstantReranker {
    fn family(&self) -> ScorerFamily {
        ScorerFamily::Bge
    }

    async fn score(&self, _query: &str, passages: &[String]) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(vec![self.score; passages.len()])
    }
}

/// Prefers passages with more query-word overlap.
pub struct OverlapReranker;

#[async_trait]
impl PairwiseReranker for OverlapReranker {
    fn family(&self) -> ScorerFamily {
        ScorerFamily::MsMarco
    }

    async fn score(&self, query: &str, passages: &[String]) -> anyhow::Result<Vec<f32>> {
        let q = tokens(query);
        Ok(passages
            .iter()
            .map(|p| {
                let words = tokens(p);
                q.iter().filter(|t| words.contains(t)).count() as f32 / 10.0
            })
            .collect())
    }
}

pub struct BrokenRewriter;

#[async_trait]
impl TextRewriter for BrokenRewriter {
    async fn rewrite(&self, _text: &str) -> anyhow::Result<String> {
        anyhow::bail!("connection refused")
    }
}

pub struct FixedRewriter(pub &'static str);

#[async_trait]
impl TextRewriter for FixedRewriter {
    async fn rewrite(&self, _text: &str) -> anyhow::Result<String> {
        Ok(self.0.to_string())
    }
}

#[derive(Default)]
pub struct MemoryBacking {
    pub entries: Mutex<HashMap<String, CacheEntry>>,
}

#[async_trait]
impl CacheBackingStore for MemoryBacking {
    async fn get(&self, fingerprint: &str) -> anyhow::Result<Option<CacheEntry>> {
        Ok(self.entries.lock().unwrap().get(fingerprint).cloned())
    }

    async fn set(&self, fingerprint: &str, entry: &CacheEntry, _ttl: Duration) -> anyhow::Result<()> {
        self.entries.lock().unwrap().insert(fingerprint.to_string(), entry.clone());
        Ok(())
    }
}

pub struct DownBacking;

#[async_trait]
impl CacheBackingStore for DownBacking {
    async fn get(&self, _fingerprint: &str) -> anyhow::Result<Option<CacheEntry>> {
        anyhow::bail!("backing store offline")
    }

    async fn set(&self, _fingerprint: &str, _entry: &CacheEntry, _ttl: Duration) -> anyhow::Result<()> {
        anyhow::bail!("backing store offline")
    }
}

/// Settings that isolate fusion order: one variant, no rerank, no dedupe.
pub fn plain_settings() -> SearchSettings {
    let mut s = SearchSettings::default();
    s.expansion.max_variants = 1;
    s.rerank.enabled = false;
    s.diversity.enabled = false;
    s.context.enabled = false;
    s.retrieval.per_call_timeout_ms = 500;
    s
}

/// Handles kept by tests so they can inspect call counts.
pub struct Harness {
    pub dense: Arc<ScriptedIndex>,
    pub lexical: Arc<ScriptedIndex>,
    pub embedder: Arc<CountingEmbedder>,
    pub chunks: Arc<MemoryChunks>,
}

impl Harness {
    pub fn new(dense: ScriptedIndex, lexical: ScriptedIndex) -> Self {
        Self::with_chunks(dense, lexical, MemoryChunks::new(corpus()))
    }

    pub fn with_chunks(dense: ScriptedIndex, lexical: ScriptedIndex, chunks: MemoryChunks) -> Self {
        Self { dense: Arc::new(dense), lexical: Arc::new(lexical), embedder: Arc::new(CountingEmbedder::new(DIM)), chunks: Arc::new(chunks) }
    }

    /// Dense returns `[A,B,C]`, lexical returns `[B,D,A]`.
    pub fn abcd() -> Self {
        Self::new(ScriptedIndex::new(Channel::Dense, &["A", "B", "C"]), ScriptedIndex::new(Channel::Sparse, &["B", "D", "A"]))
    }

    pub fn context(&self, settings: SearchSettings) -> RetrievalContext {
        RetrievalContext::new(settings, self.dense.clone(), self.lexical.clone(), self.embedder.clone(), self.chunks.clone())
    }

    pub fn engine(&self, settings: SearchSettings) -> HybridSearchEngine {
        HybridSearchEngine::new(self.context(settings)).expect("engine")
    }
}

pub fn ids(results: &[kbsearch_core::types::RankedResult]) -> Vec<&str> {
    results.iter().map(|r| r.chunk.id.as_str()).collect()
}
