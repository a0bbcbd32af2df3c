use kbsearch_core::traits::LexicalIndex;
use kbsearch_core::types::{Channel, Chunk, ChunkMetadata, SearchFilter};
use kbsearch_text::TantivyLexicalIndex;

fn chunk(id: &str, space: &str, path: &[&str], labels: &[&str], text: &str) -> Chunk {
    Chunk {
        id: id.to_string(),
        document_id: id.split(':').next().unwrap().to_string(),
        space: space.to_string(),
        path: path.iter().map(|s| s.to_string()).collect(),
        position: 0,
        text: text.to_string(),
        token_count: 0,
        metadata: ChunkMetadata { labels: labels.iter().map(|s| s.to_string()).collect(), page_type: None },
    }
}

fn corpus() -> Vec<Chunk> {
    vec![
        chunk("fire:0", "CAMP", &["Firecraft", "Tinder"], &["outdoor"], "Dry tinder catches a spark from a ferro rod quickly."),
        chunk("fire:1", "CAMP", &["Firecraft", "Fuel"], &[], "Stack fuel wood by size: tinder, kindling, then logs for the fire."),
        chunk("net:0", "OPS", &["Networking"], &["infra"], "Restart the router when the fire alarm panel loses network."),
        chunk("deploy:0", "OPS", &["Runbook", "Deploy"], &["infra"], "The deploy process pushes a tagged build to production."),
    ]
}

fn seeded() -> TantivyLexicalIndex {
    let idx = TantivyLexicalIndex::in_memory().expect("index");
    assert_eq!(idx.index(&corpus()).expect("index chunks"), 4);
    idx
}

#[tokio::test]
async fn keyword_search_ranks_and_tags_sparse() {
    let idx = seeded();
    let hits = idx.search("tinder", 10, &SearchFilter::default()).await.expect("search");
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.source == Channel::Sparse));
    assert!(hits[0].score >= hits[1].score);
}

#[tokio::test]
async fn space_filter_is_case_insensitive() {
    let idx = seeded();
    let hits = idx.search("fire", 10, &SearchFilter::for_space("ops")).await.expect("search");
    let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, vec!["net:0"]);
}

#[tokio::test]
async fn section_prefix_and_label_filters() {
    let idx = seeded();
    let by_section = SearchFilter { path_prefix: vec!["firecraft".into()], ..Default::default() };
    assert_eq!(idx.search("tinder", 10, &by_section).await.unwrap().len(), 2);

    let narrow = SearchFilter { path_prefix: vec!["Firecraft".into(), "Fuel".into()], ..Default::default() };
    let hits = idx.search("tinder", 10, &narrow).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "fire:1");

    let labelled = SearchFilter { labels: vec!["INFRA".into()], ..Default::default() };
    let hits = idx.search("deploy", 10, &labelled).await.unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn malformed_query_syntax_does_not_fail() {
    let idx = seeded();
    assert!(idx.search("\"deploy process", 5, &SearchFilter::default()).await.is_ok());
    assert!(idx.search("deploy AND (", 5, &SearchFilter::default()).await.is_ok());
    assert!(idx.search("   ", 5, &SearchFilter::default()).await.unwrap().is_empty());
}

#[test]
fn space_counts_and_reopen_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let idx = TantivyLexicalIndex::create(dir.path()).unwrap();
    idx.index(&corpus()).unwrap();
    let counts = idx.space_counts().unwrap();
    assert_eq!(counts, vec![("CAMP".to_string(), 2), ("OPS".to_string(), 2)]);
    drop(idx);

    let reopened = TantivyLexicalIndex::open(dir.path()).unwrap();
    assert_eq!(reopened.num_docs(), 4);
}
