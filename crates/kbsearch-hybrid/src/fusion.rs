//! Reciprocal Rank Fusion.

use std::collections::{HashMap, HashSet};

use kbsearch_core::types::{Candidate, Channel, ChunkId, SearchHit, VariantSource};

/// One ranked list from one (variant, channel) retrieval call.
#[derive(Debug, Clone)]
pub struct RankedList {
    pub variant: VariantSource,
    pub channel: Channel,
    pub hits: Vec<SearchHit>,
}

impl RankedList {
    pub fn candidates(&self) -> impl Iterator<Item = Candidate> + '_ {
        self.hits.iter().map(|h| Candidate { chunk_id: h.id.clone(), channel: self.channel, score: h.score, variant: self.variant })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub chunk_id: ChunkId,
    pub score: f64,
    /// One entry per list the chunk appeared in, in list order.
    pub sources: Vec<Candidate>,
}

impl FusedCandidate {
    pub fn appearances(&self) -> usize {
        self.sources.len()
    }
}

/// Sum `1 / (k + rank)` per chunk over every list (1-based rank), best first.
/// Ties are broken by chunk id ascending. A chunk repeated inside one list
/// only counts at its best rank.
pub fn fuse(lists: &[RankedList], k: u32) -> Vec<FusedCandidate> {
    let k = f64::from(k);
    let mut by_id: HashMap<ChunkId, (f64, Vec<Candidate>)> = HashMap::new();
    for list in lists {
        let mut seen = HashSet::new();
        for (rank, candidate) in list.candidates().enumerate() {
            if !seen.insert(candidate.chunk_id.clone()) {
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let contribution = 1.0 / (k + (rank + 1) as f64);
            let entry = by_id.entry(candidate.chunk_id.clone()).or_default();
            entry.0 += contribution;
            entry.1.push(candidate);
        }
    }
    let mut fused: Vec<FusedCandidate> = by_id
        .into_iter()
        .map(|(chunk_id, (score, sources))| FusedCandidate { chunk_id, score, sources })
        .collect();
    fused.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.chunk_id.cmp(&b.chunk_id)));
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(channel: Channel, ids: &[&str]) -> RankedList {
        RankedList {
            variant: VariantSource::Original,
            channel,
            hits: ids.iter().map(|id| SearchHit { id: (*id).to_string(), score: 0.0, source: channel }).collect(),
        }
    }

    #[test]
    fn dense_and_sparse_fuse_by_formula() {
        let fused = fuse(&[list(Channel::Dense, &["A", "B", "C"]), list(Channel::Sparse, &["B", "D", "A"])], 60);
        let ids: Vec<_> = fused.iter().map(|f| f.chunk_id.as_str()).collect();
        // B = 1/62 + 1/61, A = 1/61 + 1/63, D = 1/62, C = 1/63
        assert_eq!(ids, vec!["B", "A", "D", "C"]);
        assert!((fused[0].score - (1.0 / 62.0 + 1.0 / 61.0)).abs() < 1e-12);
        assert!((fused[1].score - (1.0 / 61.0 + 1.0 / 63.0)).abs() < 1e-12);
        assert!((fused[2].score - 1.0 / 62.0).abs() < 1e-12);
        assert!((fused[3].score - 1.0 / 63.0).abs() < 1e-12);
        assert_eq!(fused[0].appearances(), 2);
        let channels: Vec<Channel> = fused[0].sources.iter().map(|c| c.channel).collect();
        assert_eq!(channels, vec![Channel::Dense, Channel::Sparse]);
        assert_eq!(fused[3].sources[0].variant, VariantSource::Original);
    }

    #[test]
    fn ties_break_by_id_and_duplicates_count_once() {
        let fused = fuse(&[list(Channel::Dense, &["z", "z"]), list(Channel::Sparse, &["a"])], 60);
        assert_eq!(fused.iter().map(|f| f.chunk_id.as_str()).collect::<Vec<_>>(), vec!["a", "z"]);
        assert!((fused[1].score - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn empty_input() {
        assert!(fuse(&[], 60).is_empty());
        assert!(fuse(&[list(Channel::Dense, &[])], 60).is_empty());
    }
}
