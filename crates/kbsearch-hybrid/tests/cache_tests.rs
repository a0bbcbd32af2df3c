mod common;

use std::sync::Arc;
use std::time::Duration;

use common::MemoryBacking;
use kbsearch_core::config::CacheSettings;
use kbsearch_core::types::{CacheEntry, FallbackTier, Intent, SearchFilter};
use kbsearch_hybrid::SemanticCache;

fn entry(fingerprint: &str, age: chrono::Duration, ttl_secs: u64) -> CacheEntry {
    CacheEntry {
        fingerprint: fingerprint.to_string(),
        results: Vec::new(),
        tier: FallbackTier::Primary,
        intent: Intent::Factual,
        created_at: chrono::Utc::now() - age,
        ttl_secs,
    }
}

#[tokio::test]
async fn promoted_entry_expires_on_its_own_clock() {
    let backing = Arc::new(MemoryBacking::default());
    let cache = SemanticCache::new(&CacheSettings::default(), Some(backing.clone()));
    let fp = cache.fingerprint("deploy process", &SearchFilter::default(), 5, "1.0");
    backing.entries.lock().unwrap().insert(fp.clone(), entry(&fp, chrono::Duration::milliseconds(1700), 2));

    assert!(cache.lookup(&fp).await.entry.is_some(), "still inside its ttl");
    tokio::time::sleep(Duration::from_millis(500)).await;

    let again = cache.lookup(&fp).await;
    assert!(again.entry.is_none(), "served past the entry's ttl");
    assert!(!again.degraded);
    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn expired_backing_entry_is_never_served() {
    let backing = Arc::new(MemoryBacking::default());
    let cache = SemanticCache::new(&CacheSettings::default(), Some(backing.clone()));
    let fp = cache.fingerprint("rollback steps", &SearchFilter::default(), 5, "1.0");
    backing.entries.lock().unwrap().insert(fp.clone(), entry(&fp, chrono::Duration::seconds(10), 2));

    assert!(cache.lookup(&fp).await.entry.is_none());
}
