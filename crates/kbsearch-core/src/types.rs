//! Domain types shared by the index adapters and the retrieval pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::text::normalize;

pub type ChunkId = String;

/// Free-form chunk metadata carried through from ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub page_type: Option<String>,
}

/// A contiguous span of a source document that is independently indexed.
///
/// - `id`: globally unique chunk identifier
/// - `document_id`: stable identity of the parent document
/// - `space`: top-level knowledge-base partition key
/// - `path`: hierarchical section titles from the document root to this chunk
/// - `position`: zero-based index of the chunk within its document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: String,
    pub space: String,
    #[serde(default)]
    pub path: Vec<String>,
    pub position: u32,
    pub text: String,
    #[serde(default)]
    pub token_count: u32,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Human-readable breadcrumb: `space > section > subsection`.
    pub fn breadcrumb(&self) -> String {
        std::iter::once(self.space.as_str())
            .chain(self.path.iter().map(String::as_str))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" > ")
    }
}

/// Which retrieval channel produced a hit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Dense,
    Sparse,
}

/// The minimal surface returned by both index kinds.
///
/// `id` matches `Chunk::id`. `score` is channel-specific but higher is
/// always better.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub id: ChunkId,
    pub score: f32,
    pub source: Channel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VariantSource {
    Original,
    Rewritten,
    Synonym,
    DomainTerm,
    SpaceContext,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryVariant {
    pub text: String,
    pub source: VariantSource,
}

impl QueryVariant {
    pub fn new(text: impl Into<String>, source: VariantSource) -> Self {
        Self { text: text.into(), source }
    }
}

/// Ordered, bounded, de-duplicated set of query variants.
///
/// The original query always occupies the first slot. Duplicates are judged
/// on normalized text and later insertions never displace earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryVariants {
    items: Vec<QueryVariant>,
    cap: usize,
}

impl QueryVariants {
    pub fn new(original: impl Into<String>, cap: usize) -> Self {
        Self {
            items: vec![QueryVariant::new(original, VariantSource::Original)],
            cap: cap.max(1),
        }
    }

    /// Returns `true` if the variant was accepted.
    pub fn push(&mut self, variant: QueryVariant) -> bool {
        if self.is_full() {
            return false;
        }
        let key = normalize(&variant.text);
        if key.is_empty() || self.items.iter().any(|v| normalize(&v.text) == key) {
            return false;
        }
        self.items.push(variant);
        true
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.cap
    }

    pub fn original(&self) -> &QueryVariant {
        &self.items[0]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, QueryVariant> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Navigational,
    Factual,
    HowTo,
    Exploratory,
    Structural,
}

impl Intent {
    pub const ALL: [Intent; 5] = [
        Intent::Navigational,
        Intent::Factual,
        Intent::HowTo,
        Intent::Exploratory,
        Intent::Structural,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Navigational => "navigational",
            Intent::Factual => "factual",
            Intent::HowTo => "how_to",
            Intent::Exploratory => "exploratory",
            Intent::Structural => "structural",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score-scale family of a pairwise relevance scorer. Rerank thresholds are
/// only comparable within one family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScorerFamily {
    /// BGE-style rerankers emitting sigmoid probabilities.
    Bge,
    /// MS MARCO cross-encoders.
    MsMarco,
}

/// A retrieval hit tagged with the variant that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub chunk_id: ChunkId,
    pub channel: Channel,
    pub score: f32,
    pub variant: VariantSource,
}

/// Hard constraints applied at retrieval time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchFilter {
    pub space: Option<String>,
    /// Section-title prefix the chunk path must start with.
    #[serde(default)]
    pub path_prefix: Vec<String>,
    /// Every listed label must be present on the chunk.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl SearchFilter {
    pub fn for_space(space: impl Into<String>) -> Self {
        Self { space: Some(space.into()), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.space.is_none() && self.path_prefix.is_empty() && self.labels.is_empty()
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        if let Some(space) = &self.space {
            if !chunk.space.eq_ignore_ascii_case(space) {
                return false;
            }
        }
        if chunk.path.len() < self.path_prefix.len()
            || !self
                .path_prefix
                .iter()
                .zip(&chunk.path)
                .all(|(want, have)| want.eq_ignore_ascii_case(have))
        {
            return false;
        }
        self.labels
            .iter()
            .all(|l| chunk.metadata.labels.iter().any(|have| have.eq_ignore_ascii_case(l)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroundingLabel {
    Grounded,
    Uncertain,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Grounding {
    pub confidence: f32,
    pub label: GroundingLabel,
    pub keyword_overlap: f32,
    pub semantic_similarity: Option<f32>,
}

/// The external result unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedResult {
    pub chunk: Chunk,
    pub fused_score: f64,
    pub rerank_score: Option<f32>,
    pub expanded_text: String,
    pub grounding: Option<Grounding>,
    pub source_path: String,
    /// Every (variant, channel) hit that contributed to `fused_score`.
    #[serde(default)]
    pub sources: Vec<Candidate>,
}

impl RankedResult {
    pub fn new(chunk: Chunk, fused_score: f64) -> Self {
        let source_path = chunk.breadcrumb();
        let expanded_text = chunk.text.clone();
        Self { chunk, fused_score, rerank_score: None, expanded_text, grounding: None, source_path, sources: Vec::new() }
    }

    pub fn with_sources(mut self, sources: Vec<Candidate>) -> Self {
        self.sources = sources;
        self
    }

    /// Whether any contributing hit came from `channel`.
    pub fn matched_by(&self, channel: Channel) -> bool {
        self.sources.iter().any(|c| c.channel == channel)
    }

    /// Score used for final ordering: rerank score when present, fused otherwise.
    pub fn effective_score(&self) -> f64 {
        self.rerank_score.map_or(self.fused_score, f64::from)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTier {
    Primary,
    Relaxed,
    LexicalOnly,
    Exhausted,
}

impl FallbackTier {
    pub fn next(self) -> Self {
        match self {
            FallbackTier::Primary => FallbackTier::Relaxed,
            FallbackTier::Relaxed => FallbackTier::LexicalOnly,
            FallbackTier::LexicalOnly | FallbackTier::Exhausted => FallbackTier::Exhausted,
        }
    }
}

impl fmt::Display for FallbackTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FallbackTier::Primary => "primary",
            FallbackTier::Relaxed => "relaxed",
            FallbackTier::LexicalOnly => "lexical_only",
            FallbackTier::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

/// Stages that ran in a reduced form for this request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Degradations {
    pub rewrite: bool,
    pub dense: bool,
    pub sparse: bool,
    pub rerank: bool,
    pub context: bool,
    pub grounding: bool,
    pub cache: bool,
}

impl Degradations {
    pub fn any(&self) -> bool {
        self.rewrite
            || self.dense
            || self.sparse
            || self.rerank
            || self.context
            || self.grounding
            || self.cache
    }

    pub fn merge(&mut self, other: Degradations) {
        self.rewrite |= other.rewrite;
        self.dense |= other.dense;
        self.sparse |= other.sparse;
        self.rerank |= other.rerank;
        self.context |= other.context;
        self.grounding |= other.grounding;
        self.cache |= other.cache;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmptyReason {
    NoContentFound,
}

impl fmt::Display for EmptyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmptyReason::NoContentFound => f.write_str("no content found"),
        }
    }
}

/// A search request as accepted from callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Query {
    pub text: String,
    pub space: Option<String>,
    pub limit: Option<usize>,
    /// Optional draft answer to score against the retrieved context.
    pub answer: Option<String>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Self::default() }
    }

    pub fn with_space(mut self, space: impl Into<String>) -> Self {
        self.space = Some(space.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = Some(answer.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResponse {
    pub results: Vec<RankedResult>,
    pub tier: FallbackTier,
    pub intent: Intent,
    pub degraded: Degradations,
    pub empty_reason: Option<EmptyReason>,
    pub from_cache: bool,
    pub fingerprint: String,
}

/// A cached, fully ranked response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub results: Vec<RankedResult>,
    pub tier: FallbackTier,
    pub intent: Intent,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        let ttl_ms = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX).saturating_mul(1000);
        now.signed_duration_since(self.created_at).num_milliseconds() >= ttl_ms
    }
}
