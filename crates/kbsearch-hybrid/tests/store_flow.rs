//! End to end over the real stores: tantivy for keywords, LanceDB for
//! vectors and chunk bodies, hashing embedder in place of the model.

use std::sync::Arc;
use tempfile::TempDir;

use kbsearch_core::config::SearchSettings;
use kbsearch_core::types::{Chunk, ChunkMetadata, FallbackTier, Query};
use kbsearch_embed::FakeEmbedder;
use kbsearch_hybrid::{DirectoryBackingStore, HybridSearchEngine, RetrievalContext};
use kbsearch_text::TantivyLexicalIndex;
use kbsearch_vector::LanceChunkIndex;

const DIM: usize = 64;

fn chunk(doc: &str, pos: u32, space: &str, path: &[&str], text: &str) -> Chunk {
    Chunk {
        id: format!("{doc}:{pos}"),
        document_id: doc.to_string(),
        space: space.to_string(),
        path: path.iter().map(|s| s.to_string()).collect(),
        position: pos,
        text: text.to_string(),
        token_count: 0,
        metadata: ChunkMetadata::default(),
    }
}

fn corpus() -> Vec<Chunk> {
    vec![
        chunk("deploy", 0, "OPS", &["Runbook", "Deploy"], "deploy process overview for the payments service"),
        chunk("deploy", 1, "OPS", &["Runbook", "Deploy"], "tag the build before you deploy anything"),
        chunk("deploy", 2, "OPS", &["Runbook", "Deploy"], "watch dashboards after the deploy rollout"),
        chunk("deploy", 3, "OPS", &["Runbook", "Deploy"], "deploy rollback steps when alarms fire"),
        chunk("fire", 0, "CAMP", &["Firecraft"], "dry tinder catches a spark from a ferro rod"),
        chunk("fire", 1, "CAMP", &["Firecraft"], "feed kindling slowly once the flame holds"),
    ]
}

struct Stores {
    _tmp: TempDir,
    engine: HybridSearchEngine,
}

async fn stores() -> Stores {
    let tmp = TempDir::new().unwrap();
    let chunks = corpus();

    let lexical = TantivyLexicalIndex::create(&tmp.path().join("text")).unwrap();
    lexical.index(&chunks).unwrap();

    let embedder = FakeEmbedder::new(DIM);
    let vectors: Vec<Vec<f32>> = chunks.iter().map(|c| embedder.embed_text(&c.text)).collect();
    let uri = tmp.path().join("lance").to_string_lossy().to_string();
    let dense = Arc::new(LanceChunkIndex::open(&uri, DIM).await.unwrap());
    dense.writer().unwrap().insert(&chunks, &vectors).await.unwrap();

    let mut settings = SearchSettings::default();
    settings.rerank.enabled = false;
    let backing = DirectoryBackingStore::new(tmp.path().join("cache")).unwrap();
    let ctx = RetrievalContext::new(settings, dense.clone(), Arc::new(lexical), Arc::new(embedder), dense)
        .with_cache_backing(Arc::new(backing))
        .with_known_spaces(["OPS", "CAMP"]);
    Stores { engine: HybridSearchEngine::new(ctx).unwrap(), _tmp: tmp }
}

#[tokio::test]
async fn search_runs_over_real_stores() {
    let s = stores().await;
    let resp = s.engine.search(Query::new("deploy process")).await.unwrap();

    assert_eq!(resp.tier, FallbackTier::Primary);
    assert_eq!(resp.results[0].chunk.id, "deploy:0");
    assert_eq!(resp.results[0].source_path, "OPS > Runbook > Deploy");
    assert!(resp.results[0].expanded_text.contains("tag the build"));
    assert!(resp.results.iter().filter(|r| r.chunk.document_id == "deploy").count() <= 3);
    assert!(resp.results.iter().all(|r| r.grounding.is_some()));
}

#[tokio::test]
async fn caller_space_restricts_both_channels() {
    let s = stores().await;
    let resp = s.engine.search(Query::new("tinder spark").with_space("camp")).await.unwrap();
    assert!(!resp.results.is_empty());
    assert!(resp.results.iter().all(|r| r.chunk.space == "CAMP"));
    assert_eq!(resp.results[0].chunk.id, "fire:0");
}

#[tokio::test]
async fn file_backed_cache_round_trips() {
    let s = stores().await;
    let first = s.engine.search(Query::new("deploy rollback")).await.unwrap();
    s.engine.cache().clear();
    let second = s.engine.search(Query::new("deploy rollback")).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.results, first.results);
}
