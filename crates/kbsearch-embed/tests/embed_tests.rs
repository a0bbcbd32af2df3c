use kbsearch_core::traits::EmbeddingProvider;
use kbsearch_embed::{get_default_embedder, FakeEmbedder};

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[tokio::test]
async fn fake_embedder_shapes_and_determinism() {
    // Force fake embedder to avoid loading large model
    std::env::set_var("APP_USE_FAKE_EMBEDDINGS", "1");

    let embedder = get_default_embedder().expect("embedder");
    let texts = vec!["hello world".to_string(), "hello world".to_string()];
    let embs = embedder.embed_batch(&texts).await.expect("embed_batch");
    let (v1, v2) = (&embs[0], &embs[1]);

    assert_eq!(v1.len(), 1024, "embedding dim is 1024");
    assert_eq!(embedder.dim(), 1024);

    let norm: f32 = v1.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() <= 1e-3, "vector is L2-normalized (norm={norm})");

    for (a, b) in v1.iter().zip(v2.iter()) {
        assert!((a - b).abs() <= 1e-6);
    }
}

#[tokio::test]
async fn fake_embedder_places_shared_words_closer() {
    let e = FakeEmbedder::new(256);
    let q = e.embed("restart ingest service").await.unwrap();
    let near = e.embed("how to restart the ingest service").await.unwrap();
    let far = e.embed("quarterly budget spreadsheet").await.unwrap();
    assert!(cosine(&q, &near) > cosine(&q, &far));
    // Case-insensitive tokens.
    assert_eq!(e.embed_text("Deploy"), e.embed_text("deploy"));
}
