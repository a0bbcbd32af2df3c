//! Grounding annotations: how well retrieved passages support a query or a
//! draft answer. Nothing here removes results.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use kbsearch_core::config::GroundingSettings;
use kbsearch_core::text::{content_words, tokens};
use kbsearch_core::traits::EmbeddingProvider;
use kbsearch_core::types::{Grounding, GroundingLabel, RankedResult};

/// Fraction of the reference's distinct content words found in `passage`.
pub fn keyword_overlap(reference: &str, passage: &str) -> f32 {
    let wanted: HashSet<String> = content_words(reference).into_iter().collect();
    if wanted.is_empty() {
        return 0.0;
    }
    let have: HashSet<String> = tokens(passage).into_iter().collect();
    wanted.iter().filter(|w| have.contains(*w)).count() as f32 / wanted.len() as f32
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// Share of answer sentences with at least half of their content words
/// present somewhere in `passages`.
pub fn sentence_support(answer: &str, passages: &[&str]) -> f32 {
    let have: HashSet<String> = passages.iter().flat_map(|p| tokens(p)).collect();
    let mut counted = 0usize;
    let mut supported = 0usize;
    for sentence in answer.split(['.', '!', '?', '\n']) {
        let words = content_words(sentence);
        if words.is_empty() {
            continue;
        }
        counted += 1;
        let found = words.iter().filter(|w| have.contains(*w)).count();
        if found * 2 >= words.len() {
            supported += 1;
        }
    }
    if counted == 0 {
        0.0
    } else {
        supported as f32 / counted as f32
    }
}

/// Report for [`GroundingScorer::check_answer`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerCheck {
    pub keyword_overlap: f32,
    pub sentence_support: f32,
    pub semantic_similarity: Option<f32>,
    pub confidence: f32,
    pub label: GroundingLabel,
}

pub struct GroundingScorer {
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    keyword_weight: f32,
    semantic_weight: f32,
    cutoff: f32,
    timeout: Duration,
}

impl GroundingScorer {
    pub fn new(settings: &GroundingSettings, embedder: Option<Arc<dyn EmbeddingProvider>>, timeout: Duration) -> Self {
        Self {
            embedder,
            keyword_weight: settings.keyword_weight,
            semantic_weight: settings.semantic_weight,
            cutoff: settings.grounded_cutoff,
            timeout,
        }
    }

    /// Weighted blend in `[0, 1]`. Without a semantic score the keyword
    /// overlap stands alone.
    pub fn blend(&self, keyword: f32, semantic: Option<f32>) -> f32 {
        let confidence = match semantic {
            Some(sem) if self.keyword_weight + self.semantic_weight > 0.0 => {
                (keyword * self.keyword_weight + sem.clamp(0.0, 1.0) * self.semantic_weight) / (self.keyword_weight + self.semantic_weight)
            }
            _ => keyword,
        };
        confidence.clamp(0.0, 1.0)
    }

    pub fn label(&self, confidence: f32) -> GroundingLabel {
        if confidence >= self.cutoff {
            GroundingLabel::Grounded
        } else {
            GroundingLabel::Uncertain
        }
    }

    async fn embed_all(&self, texts: Vec<String>) -> Option<Vec<Vec<f32>>> {
        let embedder = self.embedder.as_ref()?;
        let expected = texts.len();
        match tokio::time::timeout(self.timeout, embedder.embed_batch(&texts)).await {
            Ok(Ok(v)) if v.len() == expected => Some(v),
            Ok(Ok(v)) => {
                tracing::warn!(stage = "grounding", expected, got = v.len(), "embedding count mismatch");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(stage = "grounding", error = %e, "embedding failed, keyword overlap only");
                None
            }
            Err(_) => {
                tracing::warn!(stage = "grounding", "embedding timed out, keyword overlap only");
                None
            }
        }
    }

    /// Annotate every result. The reference is the draft answer when given,
    /// the query otherwise. Returns `true` if the semantic half was skipped
    /// because the embedder failed.
    pub async fn annotate(&self, query: &str, answer: Option<&str>, results: &mut [RankedResult]) -> bool {
        if results.is_empty() {
            return false;
        }
        let reference = match answer {
            Some(a) => format!("{query} {a}"),
            None => query.to_string(),
        };
        let semantic_anchor = answer.unwrap_or(query).to_string();

        let mut texts = Vec::with_capacity(results.len() + 1);
        texts.push(semantic_anchor);
        texts.extend(results.iter().map(|r| r.expanded_text.clone()));
        let vectors = self.embed_all(texts).await;
        let degraded = self.embedder.is_some() && vectors.is_none();

        for (i, r) in results.iter_mut().enumerate() {
            let keyword = keyword_overlap(&reference, &r.expanded_text);
            let semantic = vectors.as_ref().map(|v| cosine(&v[0], &v[i + 1]));
            let confidence = self.blend(keyword, semantic);
            r.grounding = Some(Grounding { confidence, label: self.label(confidence), keyword_overlap: keyword, semantic_similarity: semantic });
        }
        degraded
    }

    /// Score a generated answer against results already returned.
    pub async fn check_answer(&self, query: &str, answer: &str, results: &[RankedResult]) -> AnswerCheck {
        let passages: Vec<&str> = results.iter().map(|r| r.expanded_text.as_str()).collect();
        let joined = passages.join("\n");
        let keyword = keyword_overlap(&format!("{query} {answer}"), &joined);
        let support = sentence_support(answer, &passages);

        let semantic = if results.is_empty() {
            None
        } else {
            let mut texts = vec![answer.to_string()];
            texts.extend(passages.iter().map(|p| p.to_string()));
            self.embed_all(texts)
                .await
                .map(|v| v[1..].iter().map(|p| cosine(&v[0], p)).fold(f32::MIN, f32::max))
        };

        let lexical = (keyword + support) / 2.0;
        let confidence = self.blend(lexical, semantic);
        AnswerCheck { keyword_overlap: keyword, sentence_support: support, semantic_similarity: semantic, confidence, label: self.label(confidence) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> GroundingScorer {
        GroundingScorer::new(&GroundingSettings::default(), None, Duration::from_millis(100))
    }

    #[test]
    fn overlap_counts_distinct_content_words() {
        let o = keyword_overlap("deploy the payment service", "We deploy services via the payment gateway");
        assert!((o - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(keyword_overlap("a the of", "anything"), 0.0);
    }

    #[test]
    fn sentence_support_is_per_sentence() {
        let passages = ["Rotate database credentials every quarter using vault."];
        let s = sentence_support("Rotate credentials every quarter. Bananas grow quickly outside.", &passages);
        assert!((s - 0.5).abs() < 1e-6);
    }

    #[test]
    fn blend_without_semantic_uses_keywords() {
        let s = scorer();
        assert!((s.blend(0.7, None) - 0.7).abs() < 1e-6);
        let both = s.blend(1.0, Some(0.0));
        assert!((both - 0.4).abs() < 1e-6);
        assert_eq!(s.label(0.5), GroundingLabel::Grounded);
        assert_eq!(s.label(0.49), GroundingLabel::Uncertain);
    }

    #[tokio::test]
    async fn annotate_never_drops_results() {
        let s = scorer();
        let mut results = vec![RankedResult::new(
            kbsearch_core::types::Chunk {
                id: "c1".into(),
                document_id: "d1".into(),
                space: "ENG".into(),
                path: vec![],
                position: 0,
                text: "unrelated text".into(),
                token_count: 2,
                metadata: Default::default(),
            },
            0.1,
        )];
        let degraded = s.annotate("deploy service", None, &mut results).await;
        assert!(!degraded);
        assert_eq!(results.len(), 1);
        let g = results[0].grounding.as_ref().unwrap();
        assert_eq!(g.label, GroundingLabel::Uncertain);
        assert!(g.semantic_similarity.is_none());
    }
}
