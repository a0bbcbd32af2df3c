//! Near-duplicate removal and per-document caps.

use std::collections::{HashMap, HashSet};

use kbsearch_core::config::DiversitySettings;
use kbsearch_core::text::{normalize, tokens};
use kbsearch_core::types::RankedResult;

const SHINGLE: usize = 3;

/// Word 3-shingles of the normalized text. Texts shorter than one shingle
/// yield themselves as a single shingle.
pub fn shingles(text: &str) -> HashSet<String> {
    let words = tokens(text);
    if words.len() < SHINGLE {
        return std::iter::once(words.join(" ")).filter(|s| !s.is_empty()).collect();
    }
    words.windows(SHINGLE).map(|w| w.join(" ")).collect()
}

/// Two empty sets share nothing: texts without word tokens are only ever
/// duplicates through the exact-match check.
#[allow(clippy::cast_precision_loss)]
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    let inter = a.intersection(b).count();
    let union = a.len() + b.len() - inter;
    if union == 0 {
        return 0.0;
    }
    inter as f32 / union as f32
}

/// Drop results whose text repeats an earlier (higher-ranked) one, exactly
/// or with shingle similarity at or above `threshold`.
pub fn dedupe(results: Vec<RankedResult>, threshold: f32) -> Vec<RankedResult> {
    let mut seen_exact: HashSet<String> = HashSet::new();
    let mut kept_shingles: Vec<HashSet<String>> = Vec::new();
    let mut kept = Vec::with_capacity(results.len());
    for r in results {
        let norm = normalize(&r.chunk.text);
        if !seen_exact.insert(norm) {
            continue;
        }
        let sh = shingles(&r.chunk.text);
        if kept_shingles.iter().any(|k| jaccard(k, &sh) >= threshold) {
            continue;
        }
        kept_shingles.push(sh);
        kept.push(r);
    }
    kept
}

/// Keep at most `cap` results per document, preserving rank order.
pub fn cap_per_document(results: Vec<RankedResult>, cap: usize) -> Vec<RankedResult> {
    let mut per_doc: HashMap<String, usize> = HashMap::new();
    results
        .into_iter()
        .filter(|r| {
            let n = per_doc.entry(r.chunk.document_id.clone()).or_default();
            *n += 1;
            *n <= cap
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct DiversityFilter {
    enabled: bool,
    threshold: f32,
}

impl DiversityFilter {
    pub fn new(settings: &DiversitySettings) -> Self {
        Self { enabled: settings.enabled, threshold: settings.near_duplicate_threshold }
    }

    /// `cap` of `None` skips the per-document limit.
    pub fn apply(&self, results: Vec<RankedResult>, cap: Option<usize>) -> Vec<RankedResult> {
        if !self.enabled {
            return results;
        }
        let before = results.len();
        let deduped = dedupe(results, self.threshold);
        let after_dedupe = deduped.len();
        let out = match cap {
            Some(cap) => cap_per_document(deduped, cap.max(1)),
            None => deduped,
        };
        tracing::debug!(stage = "diversity", before, after_dedupe, after = out.len(), "diversity applied");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbsearch_core::types::{Chunk, ChunkMetadata};

    fn result(id: &str, doc: &str, text: &str, score: f64) -> RankedResult {
        RankedResult::new(
            Chunk {
                id: id.into(),
                document_id: doc.into(),
                space: "ENG".into(),
                path: vec![],
                position: 0,
                text: text.into(),
                token_count: 0,
                metadata: ChunkMetadata::default(),
            },
            score,
        )
    }

    #[test]
    fn exact_and_near_duplicates_keep_the_first() {
        let rs = vec![
            result("a", "d1", "restart the payment service with the deploy script today", 0.9),
            result("b", "d2", "Restart the payment   service with the deploy script today", 0.8),
            result("c", "d3", "restart the payment service with the deploy script today please", 0.7),
            result("d", "d4", "rotate the database credentials every quarter", 0.6),
        ];
        let ids: Vec<_> = dedupe(rs, 0.75).into_iter().map(|r| r.chunk.id).collect();
        assert_eq!(ids, vec!["a", "d"]);
    }

    #[test]
    fn tokenless_texts_are_not_near_duplicates() {
        let rs = vec![
            result("a", "d1", "{ } => ();", 0.9),
            result("b", "d2", "&& || !=", 0.8),
            result("c", "d3", "{ }   => ();", 0.7),
        ];
        assert_eq!(jaccard(&shingles("=>"), &shingles("&&")), 0.0);
        let ids: Vec<_> = dedupe(rs, 0.9).into_iter().map(|r| r.chunk.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn cap_preserves_rank_order() {
        let rs = vec![
            result("a", "d1", "one alpha", 0.9),
            result("b", "d1", "two beta", 0.8),
            result("c", "d2", "three gamma", 0.7),
            result("d", "d1", "four delta", 0.6),
        ];
        let ids: Vec<_> = cap_per_document(rs, 2).into_iter().map(|r| r.chunk.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
