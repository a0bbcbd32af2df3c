//! Pairwise reranking with per-family, per-intent score thresholds.

use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use kbsearch_core::config::RerankSettings;
use kbsearch_core::traits::PairwiseReranker;
use kbsearch_core::types::{Intent, RankedResult, ScorerFamily};

/// Calibrated rerank cut-offs. Scores from different scorer families are on
/// different scales, so every lookup names the family that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdTable {
    thresholds: HashMap<(ScorerFamily, Intent), f32>,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        let mut thresholds = HashMap::new();
        // (family, general, technical, permissive)
        for (family, general, technical, permissive) in [
            (ScorerFamily::Bge, 0.001_f32, 0.01_f32, 0.0001_f32),
            (ScorerFamily::MsMarco, 0.005, 0.01, 0.0025),
        ] {
            thresholds.insert((family, Intent::Navigational), general * 1.5);
            thresholds.insert((family, Intent::Factual), general);
            thresholds.insert((family, Intent::HowTo), technical);
            thresholds.insert((family, Intent::Exploratory), permissive);
            thresholds.insert((family, Intent::Structural), permissive);
        }
        Self { thresholds }
    }
}

impl ThresholdTable {
    pub fn with_overrides(mut self, family: ScorerFamily, overrides: &BTreeMap<Intent, f32>) -> Self {
        for (intent, value) in overrides {
            self.thresholds.insert((family, *intent), *value);
        }
        self
    }

    pub fn get(&self, family: ScorerFamily, intent: Intent) -> f32 {
        self.thresholds.get(&(family, intent)).copied().unwrap_or(0.0)
    }
}

#[derive(Debug)]
pub struct RerankOutcome {
    pub results: Vec<RankedResult>,
    /// Scorer failed; `results` is the input order, unfiltered.
    pub degraded: bool,
}

pub struct Reranker {
    scorer: Option<Arc<dyn PairwiseReranker>>,
    family: ScorerFamily,
    batch_size: usize,
    timeout: Duration,
}

impl Reranker {
    pub fn new(scorer: Option<Arc<dyn PairwiseReranker>>, settings: &RerankSettings) -> Self {
        let family = scorer.as_ref().map_or(settings.family, |s| s.family());
        Self { scorer, family, batch_size: settings.batch_size.max(1), timeout: Duration::from_millis(settings.timeout_ms) }
    }

    /// Family whose threshold table applies to this reranker's scores.
    pub fn family(&self) -> ScorerFamily {
        self.family
    }

    pub fn is_enabled(&self) -> bool {
        self.scorer.is_some()
    }

    async fn score_all(&self, scorer: &dyn PairwiseReranker, query: &str, pool: &[RankedResult]) -> anyhow::Result<Vec<f32>> {
        let batches: Vec<Vec<String>> = pool.chunks(self.batch_size).map(|b| b.iter().map(|r| r.chunk.text.clone()).collect()).collect();
        let calls = batches.iter().map(|passages| async move {
            let scores = tokio::time::timeout(self.timeout, scorer.score(query, passages))
                .await
                .map_err(|_| anyhow::anyhow!("rerank batch timed out after {}ms", self.timeout.as_millis()))??;
            if scores.len() != passages.len() {
                anyhow::bail!("scorer returned {} scores for {} passages", scores.len(), passages.len());
            }
            Ok(scores)
        });
        let mut all = Vec::with_capacity(pool.len());
        for batch in join_all(calls).await {
            all.extend(batch?);
        }
        Ok(all)
    }

    /// Score `pool` and keep results at or above `threshold`, best first.
    /// Any scorer failure returns the pool untouched and flags degradation.
    pub async fn rerank(&self, query: &str, pool: Vec<RankedResult>, threshold: f32) -> RerankOutcome {
        let Some(scorer) = self.scorer.as_deref() else {
            return RerankOutcome { results: pool, degraded: false };
        };
        if pool.is_empty() {
            return RerankOutcome { results: pool, degraded: false };
        }
        match self.score_all(scorer, query, &pool).await {
            Ok(scores) => {
                let before = pool.len();
                let mut results: Vec<RankedResult> = pool
                    .into_iter()
                    .zip(scores)
                    .filter(|(_, s)| *s >= threshold)
                    .map(|(mut r, s)| {
                        r.rerank_score = Some(s);
                        r
                    })
                    .collect();
                results.sort_by(|a, b| b.effective_score().total_cmp(&a.effective_score()).then_with(|| a.chunk.id.cmp(&b.chunk.id)));
                tracing::debug!(stage = "rerank", family = ?self.family, threshold, kept = results.len(), dropped = before - results.len(), "rerank applied");
                RerankOutcome { results, degraded: false }
            }
            Err(e) => {
                tracing::warn!(stage = "rerank", error = %e, "scorer unavailable, keeping fused order");
                RerankOutcome { results: pool, degraded: true }
            }
        }
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
    raw_scores: bool,
    truncate: bool,
}

#[derive(Deserialize, Debug)]
struct RerankScore {
    index: usize,
    score: f32,
}

/// Cross-encoder served over HTTP with a TEI-compatible `/rerank` route.
pub struct HttpCrossEncoder {
    client: reqwest::Client,
    url: String,
    family: ScorerFamily,
}

impl HttpCrossEncoder {
    pub fn new(settings: &RerankSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .context("building reranker HTTP client")?;
        Ok(Self { client, url: settings.url.trim_end_matches('/').to_string(), family: settings.family })
    }
}

#[async_trait]
impl PairwiseReranker for HttpCrossEncoder {
    fn family(&self) -> ScorerFamily {
        self.family
    }

    async fn score(&self, query: &str, passages: &[String]) -> anyhow::Result<Vec<f32>> {
        let body = RerankRequest { query, texts: passages, raw_scores: false, truncate: true };
        let response = self
            .client
            .post(format!("{}/rerank", self.url))
            .json(&body)
            .send()
            .await
            .context("rerank request failed")?
            .error_for_status()
            .context("reranker returned an error status")?;
        let scored: Vec<RerankScore> = response.json().await.context("malformed rerank response")?;
        // The service sorts by score; restore input order.
        let mut scores = vec![f32::NAN; passages.len()];
        for s in scored {
            let slot = scores.get_mut(s.index).ok_or_else(|| anyhow::anyhow!("rerank index {} out of range", s.index))?;
            *slot = s.score;
        }
        if scores.iter().any(|s| s.is_nan()) {
            anyhow::bail!("reranker omitted some passages");
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_keyed_by_family() {
        let t = ThresholdTable::default();
        assert!((t.get(ScorerFamily::Bge, Intent::Factual) - 0.001).abs() < 1e-9);
        assert!((t.get(ScorerFamily::MsMarco, Intent::Factual) - 0.005).abs() < 1e-9);
        assert!((t.get(ScorerFamily::Bge, Intent::Navigational) - 0.0015).abs() < 1e-9);
        assert!((t.get(ScorerFamily::MsMarco, Intent::HowTo) - 0.01).abs() < 1e-9);

        let mut o = BTreeMap::new();
        o.insert(Intent::HowTo, 0.2);
        let t = t.with_overrides(ScorerFamily::MsMarco, &o);
        assert!((t.get(ScorerFamily::MsMarco, Intent::HowTo) - 0.2).abs() < 1e-9);
        assert!((t.get(ScorerFamily::Bge, Intent::HowTo) - 0.01).abs() < 1e-9);
    }
}
