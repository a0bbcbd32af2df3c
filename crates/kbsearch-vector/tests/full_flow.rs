use kbsearch_core::traits::{ChunkStore, DenseIndex};
use kbsearch_core::types::{Channel, Chunk, ChunkMetadata, SearchFilter};
use kbsearch_embed::FakeEmbedder;
use kbsearch_vector::LanceChunkIndex;
use tempfile::TempDir;

const DIM: usize = 64;

fn chunk(doc: &str, pos: u32, space: &str, path: &[&str], labels: &[&str], text: &str) -> Chunk {
    Chunk {
        id: format!("{doc}:{pos}"),
        document_id: doc.to_string(),
        space: space.to_string(),
        path: path.iter().map(|s| s.to_string()).collect(),
        position: pos,
        text: text.to_string(),
        token_count: 0,
        metadata: ChunkMetadata {
            labels: labels.iter().map(|s| s.to_string()).collect(),
            page_type: (pos == 0).then(|| "runbook".to_string()),
        },
    }
}

fn corpus() -> Vec<Chunk> {
    vec![
        chunk("deploy", 0, "OPS", &["Runbook", "Deploy"], &["infra"], "deploy process overview"),
        chunk("deploy", 1, "OPS", &["Runbook", "Deploy"], &["infra"], "tag the build before deploy"),
        chunk("deploy", 2, "OPS", &["Runbook", "Deploy"], &["infra"], "watch dashboards after rollout"),
        chunk("deploy", 3, "OPS", &["Runbook", "Deploy"], &["infra"], "rollback steps"),
        chunk("fire", 0, "CAMP", &["Firecraft"], &[], "dry tinder catches a spark"),
    ]
}

async fn seeded(tmp: &TempDir) -> LanceChunkIndex {
    let uri = tmp.path().to_string_lossy().to_string();
    let index = LanceChunkIndex::open(&uri, DIM).await.expect("open");
    let embedder = FakeEmbedder::new(DIM);
    let chunks = corpus();
    let vectors: Vec<Vec<f32>> = chunks.iter().map(|c| embedder.embed_text(&c.text)).collect();
    let written = index.writer().unwrap().insert(&chunks, &vectors).await.expect("insert");
    assert_eq!(written, 5);
    index
}

#[tokio::test]
async fn dense_search_prefers_similar_text() {
    let tmp = TempDir::new().unwrap();
    let index = seeded(&tmp).await;
    assert_eq!(index.count().await.unwrap(), 5);
    assert_eq!(index.dim(), DIM);

    let q = FakeEmbedder::new(DIM).embed_text("deploy process");
    let hits = index.search(&q, 3, &SearchFilter::default()).await.expect("search");
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].id, "deploy:0");
    assert!(hits.iter().all(|h| h.source == Channel::Dense));
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn dense_search_applies_filters_before_cut() {
    let tmp = TempDir::new().unwrap();
    let index = seeded(&tmp).await;
    let q = FakeEmbedder::new(DIM).embed_text("deploy process");

    let hits = index.search(&q, 10, &SearchFilter::for_space("camp")).await.unwrap();
    assert_eq!(hits.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(), vec!["fire:0"]);

    let by_path = SearchFilter { path_prefix: vec!["runbook".into()], ..Default::default() };
    assert_eq!(index.search(&q, 10, &by_path).await.unwrap().len(), 4);

    let by_label = SearchFilter { labels: vec!["INFRA".into()], ..Default::default() };
    assert_eq!(index.search(&q, 10, &by_label).await.unwrap().len(), 4);
}

#[tokio::test]
async fn chunk_store_get_and_neighbors() {
    let tmp = TempDir::new().unwrap();
    let index = seeded(&tmp).await;

    let c = index.get("deploy:1").await.unwrap().expect("present");
    assert_eq!(c, corpus()[1]);
    assert!(index.get("missing").await.unwrap().is_none());

    let n = index.get_neighbors("deploy", 0..=2).await.unwrap();
    assert_eq!(n.iter().map(|c| c.position).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(n[0].metadata.page_type.as_deref(), Some("runbook"));
}

#[tokio::test]
async fn writer_rejects_wrong_dimension() {
    let tmp = TempDir::new().unwrap();
    let index = LanceChunkIndex::open(&tmp.path().to_string_lossy(), DIM).await.unwrap();
    let err = index.writer().unwrap().insert(&corpus()[..1], &[vec![0.0; 3]]).await.unwrap_err();
    assert!(err.to_string().contains("dimension"));
}
