//! Two-tier response cache keyed by a request fingerprint.
//!
//! The local tier is an in-process moka cache with a TTL. The optional
//! backing tier is shared between processes; any failure there leaves the
//! request served from the local tier alone.

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kbsearch_core::config::CacheSettings;
use kbsearch_core::text::normalize;
use kbsearch_core::traits::CacheBackingStore;
use kbsearch_core::types::{CacheEntry, SearchFilter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub backing_errors: u64,
}

#[derive(Debug, Default)]
pub struct CacheLookup {
    pub entry: Option<Arc<CacheEntry>>,
    /// The backing tier was consulted and failed.
    pub degraded: bool,
}

pub struct SemanticCache {
    local: moka::sync::Cache<String, Arc<CacheEntry>>,
    backing: Option<Arc<dyn CacheBackingStore>>,
    enabled: bool,
    ttl: Duration,
    backing_timeout: Duration,
    corpus_version: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    backing_errors: AtomicU64,
}

impl SemanticCache {
    pub fn new(settings: &CacheSettings, backing: Option<Arc<dyn CacheBackingStore>>) -> Self {
        let ttl = Duration::from_secs(settings.ttl_secs.max(1));
        Self {
            local: moka::sync::Cache::builder().max_capacity(settings.max_entries).time_to_live(ttl).build(),
            backing,
            enabled: settings.enabled,
            ttl,
            backing_timeout: Duration::from_millis(500),
            corpus_version: AtomicU64::new(settings.corpus_version),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            backing_errors: AtomicU64::new(0),
        }
    }

    pub fn with_backing_timeout(mut self, timeout: Duration) -> Self {
        self.backing_timeout = timeout;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn corpus_version(&self) -> u64 {
        self.corpus_version.load(Ordering::Acquire)
    }

    /// Start a new corpus generation. Every existing fingerprint stops
    /// matching; the local tier is also flushed to free memory.
    pub fn bump_corpus_version(&self) -> u64 {
        let v = self.corpus_version.fetch_add(1, Ordering::AcqRel) + 1;
        self.local.invalidate_all();
        tracing::info!(corpus_version = v, "cache corpus version bumped");
        v
    }

    pub fn clear(&self) {
        self.local.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        self.local.run_pending_tasks();
        CacheStats {
            entries: self.local.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            backing_errors: self.backing_errors.load(Ordering::Relaxed),
        }
    }

    /// Hex blake3 digest of everything that can change a response.
    pub fn fingerprint(&self, query: &str, filter: &SearchFilter, limit: usize, expansion_version: &str) -> String {
        let mut h = blake3::Hasher::new();
        let mut field = |name: &str, value: &str| {
            h.update(name.as_bytes());
            h.update(&[0x1f]);
            h.update(value.as_bytes());
            h.update(&[0x1e]);
        };
        field("q", &normalize(query));
        field("space", &filter.space.as_deref().map(str::to_lowercase).unwrap_or_default());
        field("path", &filter.path_prefix.iter().map(|p| normalize(p)).collect::<Vec<_>>().join("\u{1d}"));
        let mut labels: Vec<String> = filter.labels.iter().map(|l| normalize(l)).collect();
        labels.sort();
        field("labels", &labels.join("\u{1d}"));
        field("limit", &limit.to_string());
        field("expansion", expansion_version);
        field("corpus", &self.corpus_version().to_string());
        h.finalize().to_hex().to_string()
    }

    pub async fn lookup(&self, fingerprint: &str) -> CacheLookup {
        if !self.enabled {
            return CacheLookup::default();
        }
        // The local tier's own TTL restarts when a backing entry is promoted,
        // so the entry's creation time is what bounds serving.
        if let Some(entry) = self.local.get(fingerprint) {
            if !entry.is_expired(chrono::Utc::now()) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return CacheLookup { entry: Some(entry), degraded: false };
            }
            self.local.invalidate(fingerprint);
        }
        let mut lookup = CacheLookup::default();
        if let Some(backing) = &self.backing {
            match tokio::time::timeout(self.backing_timeout, backing.get(fingerprint)).await {
                Ok(Ok(Some(entry))) if !entry.is_expired(chrono::Utc::now()) => {
                    let entry = Arc::new(entry);
                    self.local.insert(fingerprint.to_string(), entry.clone());
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return CacheLookup { entry: Some(entry), degraded: false };
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(stage = "cache", error = %e, "backing store read failed");
                    self.backing_errors.fetch_add(1, Ordering::Relaxed);
                    lookup.degraded = true;
                }
                Err(_) => {
                    tracing::warn!(stage = "cache", "backing store read timed out");
                    self.backing_errors.fetch_add(1, Ordering::Relaxed);
                    lookup.degraded = true;
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        lookup
    }

    /// Write through both tiers. Existing fingerprints are left as they are.
    /// Returns `true` if the backing tier failed.
    pub async fn store(&self, entry: CacheEntry) -> bool {
        if !self.enabled || self.local.contains_key(&entry.fingerprint) {
            return false;
        }
        let entry = Arc::new(entry);
        self.local.insert(entry.fingerprint.clone(), entry.clone());
        let Some(backing) = &self.backing else { return false };
        match tokio::time::timeout(self.backing_timeout, backing.set(&entry.fingerprint, &entry, self.ttl)).await {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                tracing::warn!(stage = "cache", error = %e, "backing store write failed");
                self.backing_errors.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                tracing::warn!(stage = "cache", "backing store write timed out");
                self.backing_errors.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }
}

/// Shared cache tier: one JSON file per fingerprint, replaced atomically.
pub struct DirectoryBackingStore {
    dir: PathBuf,
}

impl DirectoryBackingStore {
    pub fn new(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).with_context(|| format!("creating cache dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, fingerprint: &str) -> anyhow::Result<PathBuf> {
        if fingerprint.is_empty() || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
            anyhow::bail!("invalid fingerprint {fingerprint:?}");
        }
        Ok(self.dir.join(format!("{fingerprint}.json")))
    }
}

#[async_trait]
impl CacheBackingStore for DirectoryBackingStore {
    async fn get(&self, fingerprint: &str) -> anyhow::Result<Option<CacheEntry>> {
        let path = self.path_for(fingerprint)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let entry: CacheEntry = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        if entry.is_expired(chrono::Utc::now()) {
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn set(&self, fingerprint: &str, entry: &CacheEntry, ttl: Duration) -> anyhow::Result<()> {
        let path = self.path_for(fingerprint)?;
        let mut entry = entry.clone();
        entry.ttl_secs = ttl.as_secs();
        let body = serde_json::to_vec(&entry)?;
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&body)?;
            tmp.persist(&path).with_context(|| format!("replacing {}", path.display()))?;
            Ok(())
        })
        .await
        .context("cache writer task panicked")?
    }
}
