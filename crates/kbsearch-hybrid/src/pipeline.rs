//! The request orchestrator.
//!
//! Everything a search needs is constructed once into a [`RetrievalContext`]
//! and handed to [`HybridSearchEngine`]; requests share nothing mutable
//! beyond the response cache and the learned-term table.

use futures::future::join_all;
use tokio::task::JoinSet;
use tracing::Instrument;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kbsearch_core::config::SearchSettings;
use kbsearch_core::text::{tokens, truncate_chars};
use kbsearch_core::traits::{CacheBackingStore, ChunkStore, DenseIndex, EmbeddingProvider, LexicalIndex, PairwiseReranker, TextRewriter};
use kbsearch_core::types::{
    CacheEntry, Degradations, EmptyReason, FallbackTier, Intent, Query, RankedResult, SearchFilter, SearchResponse,
};
use kbsearch_core::{Error, Result};

use crate::cache::{CacheStats, SemanticCache};
use crate::context::ContextExpander;
use crate::diversity::DiversityFilter;
use crate::expansion::QueryExpander;
use crate::fallback::{FallbackOrchestrator, TierPlan};
use crate::fusion::{fuse, FusedCandidate};
use crate::grounding::{AnswerCheck, GroundingScorer};
use crate::intent::{IntentClassifier, IntentProfile};
use crate::limits::adaptive_pool;
use crate::rerank::{Reranker, ThresholdTable};
use crate::retrieval::{ChannelMode, DualRetriever};
use crate::rewriter::rewrite_best_effort;
use crate::structural::{Recognizer, StructuralParser};
use crate::synonyms::{LearnedTerms, QueryMiner};

/// Collaborators and settings for one engine instance.
pub struct RetrievalContext {
    pub settings: SearchSettings,
    pub dense: Arc<dyn DenseIndex>,
    pub lexical: Arc<dyn LexicalIndex>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub chunks: Arc<dyn ChunkStore>,
    pub reranker: Option<Arc<dyn PairwiseReranker>>,
    pub rewriter: Option<Arc<dyn TextRewriter>>,
    pub cache_backing: Option<Arc<dyn CacheBackingStore>>,
    pub learned: Arc<LearnedTerms>,
    pub miner: Arc<QueryMiner>,
    pub known_spaces: Vec<String>,
    pub known_titles: Vec<String>,
}

impl RetrievalContext {
    pub fn new(
        settings: SearchSettings,
        dense: Arc<dyn DenseIndex>,
        lexical: Arc<dyn LexicalIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunks: Arc<dyn ChunkStore>,
    ) -> Self {
        Self {
            settings,
            dense,
            lexical,
            embedder,
            chunks,
            reranker: None,
            rewriter: None,
            cache_backing: None,
            learned: Arc::new(LearnedTerms::new()),
            miner: Arc::new(QueryMiner::new()),
            known_spaces: Vec::new(),
            known_titles: Vec::new(),
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn PairwiseReranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_rewriter(mut self, rewriter: Arc<dyn TextRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    pub fn with_cache_backing(mut self, backing: Arc<dyn CacheBackingStore>) -> Self {
        self.cache_backing = Some(backing);
        self
    }

    pub fn with_learned_terms(mut self, learned: Arc<LearnedTerms>) -> Self {
        self.learned = learned;
        self
    }

    /// Share a miner, usually one loaded from a persisted query log.
    pub fn with_query_miner(mut self, miner: Arc<QueryMiner>) -> Self {
        self.miner = miner;
        self
    }

    /// Space keys: recognised in `A > B` paths and never substituted.
    pub fn with_known_spaces<I, S>(mut self, spaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_spaces.extend(spaces.into_iter().map(Into::into));
        self
    }

    pub fn with_known_titles<I, S>(mut self, titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_titles.extend(titles.into_iter().map(Into::into));
        self
    }
}

/// A query that passed validation.
#[derive(Debug, Clone, PartialEq)]
struct ValidQuery {
    text: String,
    limit: usize,
    space: Option<String>,
}

fn valid_space_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub struct HybridSearchEngine {
    settings: SearchSettings,
    classifier: IntentClassifier,
    parser: StructuralParser,
    expander: QueryExpander,
    retriever: DualRetriever,
    thresholds: ThresholdTable,
    reranker: Reranker,
    context: ContextExpander,
    diversity: DiversityFilter,
    grounding: GroundingScorer,
    cache: SemanticCache,
    rewriter: Option<Arc<dyn TextRewriter>>,
    chunks: Arc<dyn ChunkStore>,
    learned: Arc<LearnedTerms>,
    miner: Arc<QueryMiner>,
    learning: Mutex<JoinSet<()>>,
    per_call_timeout: Duration,
}

impl HybridSearchEngine {
    /// Validates settings and embedding dimensions; both are fatal here.
    pub fn new(ctx: RetrievalContext) -> Result<Self> {
        let RetrievalContext { settings, dense, lexical, embedder, chunks, reranker, rewriter, cache_backing, learned, miner, known_spaces, known_titles } = ctx;
        settings.validate()?;
        let per_call_timeout = Duration::from_millis(settings.retrieval.per_call_timeout_ms);

        let retriever = DualRetriever::new(dense, lexical, embedder.clone(), per_call_timeout);
        retriever.check_dimensions()?;

        let mut synonyms = crate::synonyms::default_synonyms();
        synonyms.extend(settings.expansion.synonyms.clone());
        let mut expander = QueryExpander::new(&settings.expansion, synonyms, learned.clone());
        expander.protect(&known_spaces);

        let reranker = Reranker::new(reranker.filter(|_| settings.rerank.enabled), &settings.rerank);
        let thresholds = ThresholdTable::default().with_overrides(reranker.family(), &settings.rerank.thresholds);

        Ok(Self {
            classifier: IntentClassifier::new().with_known_titles(&known_titles),
            parser: StructuralParser::new().with_known_spaces(&known_spaces),
            expander,
            retriever,
            thresholds,
            reranker,
            context: ContextExpander::new(chunks.clone(), &settings.context),
            diversity: DiversityFilter::new(&settings.diversity),
            grounding: GroundingScorer::new(&settings.grounding, Some(embedder), per_call_timeout),
            cache: SemanticCache::new(&settings.cache, cache_backing).with_backing_timeout(per_call_timeout),
            rewriter: rewriter.filter(|_| settings.rewriter.enabled),
            chunks,
            learned,
            miner,
            learning: Mutex::new(JoinSet::new()),
            per_call_timeout,
            settings,
        })
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    pub fn cache(&self) -> &SemanticCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn learned_terms(&self) -> &Arc<LearnedTerms> {
        &self.learned
    }

    pub fn classify(&self, text: &str) -> Intent {
        self.classifier.classify(text)
    }

    fn validate(&self, query: &Query) -> Result<ValidQuery> {
        let limits = &self.settings.limits;
        let trimmed = query.text.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("query is empty".into()));
        }
        if trimmed.chars().count() < limits.min_query_chars {
            return Err(Error::InvalidInput("query too short".into()));
        }
        let text = truncate_chars(trimmed, limits.max_query_chars).trim_end();
        if text.len() < trimmed.len() {
            tracing::warn!(max = limits.max_query_chars, "query truncated");
        }
        let space = match query.space.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) if valid_space_key(s) => Some(s.to_string()),
            Some(s) => return Err(Error::InvalidInput(format!("invalid space key {s:?}"))),
        };
        let limit = query.limit.unwrap_or(limits.default_limit).clamp(1, limits.max_limit);
        Ok(ValidQuery { text: text.to_string(), limit, space })
    }

    /// Run one search request.
    ///
    /// Only invalid input and fatal retrieval failures are errors. An empty
    /// result is a response with `tier == Exhausted` and a reason.
    pub async fn search(&self, query: Query) -> Result<SearchResponse> {
        let q = self.validate(&query)?;
        let answer = query.answer.as_deref().map(str::trim).filter(|a| !a.is_empty());
        let span = tracing::info_span!("search", limit = q.limit, space = q.space.as_deref().unwrap_or(""));
        self.search_valid(&q, answer).instrument(span).await
    }

    async fn search_valid(&self, q: &ValidQuery, answer: Option<&str>) -> Result<SearchResponse> {
        // Caller's space always wins over one recovered from the text.
        let caller_filter = SearchFilter { space: q.space.clone(), ..SearchFilter::default() };
        let structural = self.parser.parse(&q.text);
        let mut full_filter = structural.as_ref().map(|m| m.filter.clone()).unwrap_or_default();
        if caller_filter.space.is_some() {
            full_filter.space = caller_filter.space.clone();
        }
        let space_only = SearchFilter { space: full_filter.space.clone(), ..SearchFilter::default() };

        let mut intent = self.classifier.classify(&q.text);
        if structural.as_ref().is_some_and(|m| m.recognizer != Recognizer::InSpace) {
            intent = Intent::Structural;
        }
        tracing::debug!(%intent, structural = ?structural.as_ref().map(|m| m.recognizer.name()), "query classified");
        let cache_key = match answer {
            Some(a) => format!("{}\u{1f}{}", q.text, a),
            None => q.text.clone(),
        };
        let fingerprint = self.cache.fingerprint(&cache_key, &full_filter, q.limit, &self.expander.version());
        let lookup = self.cache.lookup(&fingerprint).await;
        let mut degraded = Degradations { cache: lookup.degraded, ..Degradations::default() };
        if let Some(entry) = lookup.entry {
            tracing::debug!(stage = "cache", %fingerprint, "cache hit");
            return Ok(SearchResponse {
                results: entry.results.clone(),
                tier: entry.tier,
                intent: entry.intent,
                degraded,
                empty_reason: None,
                from_cache: true,
                fingerprint,
            });
        }

        let rewritten = match &self.rewriter {
            Some(r) => {
                let outcome = rewrite_best_effort(r.as_ref(), &q.text, Duration::from_millis(self.settings.rewriter.timeout_ms)).await;
                degraded.rewrite = outcome.is_degraded();
                outcome.rewritten().map(str::to_string)
            }
            None => None,
        };
        let variants = self.expander.expand(&q.text, intent, full_filter.space.as_deref(), rewritten.as_deref());
        let profile = IntentProfile::new(intent, &self.thresholds, self.reranker.family());
        let token_count = tokens(&q.text).len();

        let mut fallback = FallbackOrchestrator::new(&self.settings.fallback);
        let mut prior_scores: Option<Vec<f32>> = None;
        // Largest non-empty attempt so far, in case no tier is sufficient.
        let mut best: Option<(FallbackTier, Vec<RankedResult>)> = None;
        // Some channel answered during this request.
        let mut reached = false;
        while !fallback.is_exhausted() {
            let plan = fallback.plan();
            let filter = if plan.structural_filter { &full_filter } else { &space_only };
            let pool = adaptive_pool(q.limit, token_count, &profile, !filter.is_empty(), prior_scores.as_deref(), plan.pool_bonus, &self.settings.retrieval);

            let outcome = match self.retriever.retrieve(&variants, pool, filter, plan.channels).await {
                Ok(outcome) => outcome,
                // A channel already answered, so this is an outage of the
                // remaining one rather than of retrieval as a whole.
                Err(Error::RetrievalUnavailable(reason)) if reached => {
                    tracing::warn!(tier = %plan.tier, %reason, "tier retrieval unavailable");
                    degraded.sparse = true;
                    if plan.channels == ChannelMode::Both {
                        degraded.dense = true;
                    }
                    fallback.escalate();
                    continue;
                }
                Err(e) => return Err(e),
            };
            reached = true;
            degraded.merge(outcome.degradations());
            let fused: Vec<FusedCandidate> = fuse(&outcome.lists, self.settings.retrieval.rrf_k).into_iter().take(pool).collect();
            #[allow(clippy::cast_possible_truncation)]
            let scores: Vec<f32> = fused.iter().map(|c| c.score as f32).collect();
            prior_scores = Some(scores);

            let attempt = self.run_tier(&q.text, q.limit, &plan, &profile, filter, fused, &mut degraded).await?;
            tracing::debug!(tier = %plan.tier, pool, results = attempt.len(), "tier finished");
            let sufficient = fallback.is_sufficient(attempt.len());
            if !attempt.is_empty() && best.as_ref().map_or(true, |(_, kept)| attempt.len() >= kept.len()) {
                best = Some((plan.tier, attempt));
            }
            if sufficient {
                break;
            }
            fallback.escalate();
        }

        let Some((tier, mut results)) = best else {
            tracing::info!(tier = %FallbackTier::Exhausted, "no content found");
            return Ok(SearchResponse {
                results: Vec::new(),
                tier: FallbackTier::Exhausted,
                intent,
                degraded,
                empty_reason: Some(EmptyReason::NoContentFound),
                from_cache: false,
                fingerprint,
            });
        };

        degraded.context = self.context.expand(&mut results, profile.context_window).await;
        degraded.grounding = self.grounding.annotate(&q.text, answer, &mut results).await;
        self.learn(&q.text, &results);

        let entry = CacheEntry { fingerprint: fingerprint.clone(), results, tier, intent, created_at: chrono::Utc::now(), ttl_secs: self.cache.ttl().as_secs() };
        let results = entry.results.clone();
        degraded.cache |= self.cache.store(entry).await;

        tracing::info!(tier = %tier, results = results.len(), degraded = degraded.any(), "search finished");
        Ok(SearchResponse { results, tier, intent, degraded, empty_reason: None, from_cache: false, fingerprint })
    }

    /// Hydrate, rerank and diversify one tier's fused candidates.
    async fn run_tier(
        &self,
        query: &str,
        limit: usize,
        plan: &TierPlan,
        profile: &IntentProfile,
        filter: &SearchFilter,
        fused: Vec<FusedCandidate>,
        degraded: &mut Degradations,
    ) -> Result<Vec<RankedResult>> {
        let hydrated = self.hydrate(fused, filter).await?;
        let ranked = if plan.rerank && self.reranker.is_enabled() {
            let threshold = profile.rerank_threshold - plan.threshold_relax;
            let outcome = self.reranker.rerank(query, hydrated, threshold).await;
            degraded.rerank |= outcome.degraded;
            outcome.results
        } else {
            hydrated
        };
        let cap = plan.diversity_cap.then_some(profile.diversity_cap);
        let mut diverse = self.diversity.apply(ranked, cap);
        diverse.truncate(limit);
        Ok(diverse)
    }

    /// Fetch chunk bodies concurrently. Unknown ids are skipped; if every
    /// lookup fails the store is considered unreachable.
    async fn hydrate(&self, fused: Vec<FusedCandidate>, filter: &SearchFilter) -> Result<Vec<RankedResult>> {
        if fused.is_empty() {
            return Ok(Vec::new());
        }
        let lookups = fused.iter().map(|c| async move {
            match tokio::time::timeout(self.per_call_timeout, self.chunks.get(&c.chunk_id)).await {
                Ok(r) => r,
                Err(_) => Err(anyhow::anyhow!("chunk lookup timed out")),
            }
        });
        let fetched = join_all(lookups).await;

        let attempted = fused.len();
        let mut failures = 0usize;
        let mut out = Vec::with_capacity(fused.len());
        for (candidate, chunk) in fused.into_iter().zip(fetched) {
            match chunk {
                Ok(Some(chunk)) if filter.matches(&chunk) => out.push(RankedResult::new(chunk, candidate.score).with_sources(candidate.sources)),
                Ok(Some(_)) => tracing::debug!(stage = "hydrate", chunk = %candidate.chunk_id, "chunk outside filter dropped"),
                Ok(None) => tracing::warn!(stage = "hydrate", chunk = %candidate.chunk_id, "indexed chunk missing from store"),
                Err(e) => {
                    failures += 1;
                    tracing::warn!(stage = "hydrate", chunk = %candidate.chunk_id, error = %e, "chunk lookup failed");
                }
            }
        }
        if failures == attempted {
            return Err(Error::RetrievalUnavailable(format!("chunk store unreachable ({failures} lookups failed)")));
        }
        Ok(out)
    }

    /// Feed the query miner off the request path; publish learned terms
    /// when an export is due.
    fn learn(&self, query: &str, results: &[RankedResult]) {
        let documents: Vec<String> = results.iter().map(|r| r.chunk.document_id.clone()).collect();
        let query = query.to_string();
        let (miner, learned) = (self.miner.clone(), self.learned.clone());
        let Ok(mut tasks) = self.learning.lock() else {
            tracing::warn!(stage = "query_miner", "learning task lock poisoned, query not recorded");
            return;
        };
        while tasks.try_join_next().is_some() {}
        tasks.spawn_blocking(move || {
            let due = miner.record(&query, &documents);
            if let Err(e) = miner.persist() {
                tracing::warn!(stage = "query_miner", error = %e, "persisting query log failed");
            }
            if due && miner.export(&learned) > 0 {
                if let Err(e) = learned.persist() {
                    tracing::warn!(stage = "query_miner", error = %e, "persisting learned terms failed");
                }
            }
        });
    }

    /// Wait for queued learning work to finish, e.g. before process exit.
    pub async fn flush_learning(&self) {
        let mut tasks = {
            let Ok(mut guard) = self.learning.lock() else { return };
            std::mem::take(&mut *guard)
        };
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(stage = "query_miner", error = %e, "learning task failed");
            }
        }
    }

    pub fn query_miner(&self) -> &Arc<QueryMiner> {
        &self.miner
    }

    /// Score a generated answer against results already returned.
    pub async fn check_answer(&self, query: &str, answer: &str, results: &[RankedResult]) -> AnswerCheck {
        self.grounding.check_answer(query, answer, results).await
    }
}
