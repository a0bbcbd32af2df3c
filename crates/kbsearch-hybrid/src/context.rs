//! Rebuilds local context around each result from its sibling chunks.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

use kbsearch_core::config::ContextSettings;
use kbsearch_core::text::truncate_chars;
use kbsearch_core::traits::ChunkStore;
use kbsearch_core::types::{Chunk, RankedResult};

pub struct ContextExpander {
    store: Arc<dyn ChunkStore>,
    enabled: bool,
    max_chars: usize,
    timeout: Duration,
}

impl ContextExpander {
    pub fn new(store: Arc<dyn ChunkStore>, settings: &ContextSettings) -> Self {
        Self { store, enabled: settings.enabled, max_chars: settings.max_chars, timeout: Duration::from_millis(settings.timeout_ms) }
    }

    /// Fill `expanded_text` for every result using neighbours within
    /// `window` positions. Returns `true` if any neighbour fetch failed; those
    /// results keep their own text.
    pub async fn expand(&self, results: &mut [RankedResult], window: u32) -> bool {
        if !self.enabled || window == 0 || results.is_empty() {
            for r in results.iter_mut() {
                r.expanded_text = truncate_chars(&r.chunk.text, self.max_chars).to_string();
            }
            return false;
        }

        let fetches = results.iter().map(|r| {
            let lo = r.chunk.position.saturating_sub(window);
            let hi = r.chunk.position.saturating_add(window);
            let doc = r.chunk.document_id.clone();
            async move {
                match tokio::time::timeout(self.timeout, self.store.get_neighbors(&doc, lo..=hi)).await {
                    Ok(Ok(chunks)) => Ok(chunks),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {}ms", self.timeout.as_millis())),
                }
            }
        });
        let fetched = join_all(fetches).await;

        let mut degraded = false;
        for (result, neighbours) in results.iter_mut().zip(fetched) {
            match neighbours {
                Ok(neighbours) => result.expanded_text = stitch(&result.chunk, neighbours, self.max_chars),
                Err(e) => {
                    tracing::warn!(stage = "context", chunk = %result.chunk.id, error = %e, "neighbour fetch failed");
                    result.expanded_text = truncate_chars(&result.chunk.text, self.max_chars).to_string();
                    degraded = true;
                }
            }
        }
        degraded
    }
}

/// Grow outward from `center`, nearest neighbours first, until the
/// character budget is spent, then emit in document order.
pub fn stitch(center: &Chunk, neighbours: Vec<Chunk>, max_chars: usize) -> String {
    let own = truncate_chars(&center.text, max_chars);
    let mut used = own.chars().count();

    let mut others: Vec<Chunk> = neighbours
        .into_iter()
        .filter(|c| c.document_id == center.document_id && c.position != center.position)
        .collect();
    others.sort_by_key(|c| (c.position.abs_diff(center.position), c.position));
    others.dedup_by_key(|c| c.position);

    let mut kept: Vec<(u32, &str)> = vec![(center.position, own)];
    for c in &others {
        let len = c.text.chars().count() + 2;
        if used + len > max_chars {
            continue;
        }
        used += len;
        kept.push((c.position, c.text.as_str()));
    }
    kept.sort_by_key(|(pos, _)| *pos);
    kept.into_iter().map(|(_, t)| t).collect::<Vec<_>>().join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbsearch_core::types::ChunkMetadata;

    fn chunk(pos: u32, text: &str) -> Chunk {
        Chunk {
            id: format!("d1#{pos}"),
            document_id: "d1".into(),
            space: "ENG".into(),
            path: vec![],
            position: pos,
            text: text.into(),
            token_count: 0,
            metadata: ChunkMetadata::default(),
        }
    }

    #[test]
    fn stitches_in_document_order() {
        let center = chunk(2, "middle");
        let out = stitch(&center, vec![chunk(3, "after"), chunk(1, "before"), chunk(2, "middle")], 100);
        assert_eq!(out, "before\n\nmiddle\n\nafter");
    }

    #[test]
    fn nearest_neighbours_win_the_budget() {
        let center = chunk(5, "cccc");
        let out = stitch(&center, vec![chunk(3, "aaaa"), chunk(4, "bbbb"), chunk(7, "eeee")], 10);
        assert_eq!(out, "bbbb\n\ncccc");
    }

    #[test]
    fn oversized_center_is_truncated() {
        let center = chunk(0, "abcdefghij");
        assert_eq!(stitch(&center, vec![], 4), "abcd");
    }
}
