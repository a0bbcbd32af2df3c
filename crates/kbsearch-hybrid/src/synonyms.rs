//! Synonym sources for query expansion: the curated table, the learned
//! domain-term table and the query miner that feeds it.

use anyhow::{Context, Result};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex};

use kbsearch_core::text::{is_stop_word, normalize, tokens};
use kbsearch_core::types::Chunk;

/// General IT vocabulary used when no table is configured.
pub fn default_synonyms() -> BTreeMap<String, Vec<String>> {
    let table: &[(&str, &[&str])] = &[
        ("stack", &["technologies", "tools", "frameworks"]),
        ("framework", &["library", "toolkit"]),
        ("development", &["dev", "coding", "programming"]),
        ("bug", &["error", "defect", "issue"]),
        ("test", &["testing", "check", "verification"]),
        ("server", &["backend", "host"]),
        ("database", &["db", "storage", "datastore"]),
        ("db", &["database", "datastore"]),
        ("container", &["docker image", "pod"]),
        ("api", &["endpoint", "interface", "rest"]),
        ("endpoint", &["api", "route"]),
        ("documentation", &["docs", "manual", "guide"]),
        ("docs", &["documentation", "manual"]),
        ("setup", &["configuration", "installation"]),
        ("config", &["configuration", "settings"]),
        ("configuration", &["config", "settings", "setup"]),
        ("install", &["installation", "setup"]),
        ("start", &["run", "launch"]),
        ("problem", &["issue", "error", "bug"]),
        ("fix", &["solution", "workaround"]),
        ("guide", &["instructions", "manual", "howto"]),
        ("team", &["group", "department"]),
        ("project", &["system", "application", "service"]),
        ("version", &["release"]),
        ("update", &["upgrade"]),
        ("deploy", &["release", "rollout"]),
        ("deployment", &["release", "rollout"]),
    ];
    table
        .iter()
        .map(|(k, vs)| ((*k).to_string(), vs.iter().map(|v| (*v).to_string()).collect()))
        .collect()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LearnedTermsFile {
    version: u64,
    terms: BTreeMap<String, Vec<String>>,
}

/// Versioned term -> substitutes table.
///
/// Reads go straight to the concurrent map; writes bump the version so the
/// response cache stops serving entries built from the previous table.
/// Persisted as JSON with an atomic replace.
#[derive(Debug, Default)]
pub struct LearnedTerms {
    terms: DashMap<String, Vec<String>>,
    version: AtomicU64,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl LearnedTerms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`; a missing file yields an empty table bound to that path.
    pub fn load(path: &Path) -> Result<Self> {
        let file: LearnedTermsFile = if path.exists() {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        } else {
            LearnedTermsFile::default()
        };
        let terms = DashMap::new();
        for (k, v) in file.terms {
            terms.insert(k, v);
        }
        Ok(Self { terms, version: AtomicU64::new(file.version), path: Some(path.to_path_buf()), write_lock: Mutex::new(()) })
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn get(&self, term: &str) -> Option<Vec<String>> {
        self.terms.get(&normalize(term)).map(|v| v.value().clone())
    }

    /// Replace the substitutes for `term`. The version only moves when the
    /// stored value changes. Returns `true` if it did.
    pub fn insert(&self, term: &str, substitutes: Vec<String>) -> bool {
        let key = normalize(term);
        if self.terms.get(&key).is_some_and(|current| *current == substitutes) {
            return false;
        }
        self.terms.insert(key, substitutes);
        self.version.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Fold corpus-mined terms in; abbreviations map to their expansion and back.
    /// Returns the table version after the merge.
    pub fn merge_domain_terms(&self, domain: &DomainTerms) -> u64 {
        let mut changed = false;
        for (abbr, expansion) in &domain.abbreviations {
            changed |= push_unique(&mut self.terms.entry(abbr.clone()).or_default(), expansion);
            changed |= push_unique(&mut self.terms.entry(normalize(expansion)).or_default(), abbr);
        }
        if changed {
            self.version.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.version()
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.terms.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    /// Write the table to its bound path, if any.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let _guard = self.write_lock.lock().map_err(|_| anyhow::anyhow!("learned-terms write lock poisoned"))?;
        let file = LearnedTermsFile { version: self.version(), terms: self.snapshot() };
        write_json_atomic(path, &file)
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) -> bool {
    if list.iter().any(|v| v.eq_ignore_ascii_case(value)) {
        return false;
    }
    list.push(value.to_string());
    true
}

/// Atomically replace `path` with the JSON form of `value`.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(serde_json::to_string_pretty(value)?.as_bytes())?;
    tmp.persist(path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

static RE_DEFINED_ABBR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b((?:[A-Z][a-z]+\s+){1,5}[A-Z][a-z]+)\s*\(([A-Z]{2,6})\)").ok());

/// Terms mined from the corpus itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainTerms {
    /// Lowercased abbreviation -> spelled-out form, e.g. `sre` -> `Site Reliability Engineering`.
    pub abbreviations: BTreeMap<String, String>,
    /// Space keys; these are proper names and must never be substituted.
    pub spaces: BTreeSet<String>,
}

impl DomainTerms {
    pub fn mine(chunks: &[Chunk]) -> Self {
        let mut out = DomainTerms::default();
        let Some(re) = RE_DEFINED_ABBR.as_ref() else { return out };
        for chunk in chunks {
            out.spaces.insert(chunk.space.to_lowercase());
            for caps in re.captures_iter(&chunk.text) {
                let words: Vec<&str> = caps[1].split_whitespace().collect();
                let abbr = &caps[2];
                // Keep the trailing words whose initials spell the abbreviation.
                if words.len() < abbr.len() {
                    continue;
                }
                let tail = &words[words.len() - abbr.len()..];
                let initials: String = tail.iter().filter_map(|w| w.chars().next()).collect();
                if initials == abbr {
                    out.abbreviations.entry(abbr.to_lowercase()).or_insert_with(|| tail.join(" "));
                }
            }
        }
        out
    }
}

#[derive(Debug, Default)]
struct TermStats {
    /// Document id -> number of logged queries that returned it.
    documents: HashMap<String, u32>,
    count: u32,
}

/// One answered query as the miner remembers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LoggedQuery {
    terms: Vec<String>,
    documents: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueryLogFile {
    recorded: u64,
    queries: Vec<LoggedQuery>,
}

/// Where the query log lives for a given learned-terms file.
pub fn query_log_path(learned_terms_path: &Path) -> PathBuf {
    learned_terms_path.with_extension("queries.json")
}

/// Learns substitutes from which documents each query term retrieves.
///
/// Two terms whose result-document sets overlap strongly (Jaccard) are
/// treated as interchangeable. Only the most recent `max_log` queries count;
/// older ones are evicted and their evidence withdrawn.
#[derive(Debug)]
pub struct QueryMiner {
    log: Mutex<VecDeque<LoggedQuery>>,
    stats: DashMap<String, TermStats>,
    recorded: AtomicU64,
    export_every: u64,
    max_log: usize,
    path: Option<PathBuf>,
    pub jaccard_threshold: f32,
    pub min_documents: usize,
    pub min_count: u32,
    pub max_synonyms: usize,
}

impl Default for QueryMiner {
    fn default() -> Self {
        Self {
            log: Mutex::new(VecDeque::new()),
            stats: DashMap::new(),
            recorded: AtomicU64::new(0),
            export_every: 50,
            max_log: 1000,
            path: None,
            jaccard_threshold: 0.5,
            min_documents: 2,
            min_count: 3,
            max_synonyms: 5,
        }
    }
}

impl QueryMiner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a persisted query log and rebuild term statistics from it. A
    /// missing file yields an empty miner bound to that path.
    pub fn load(path: &Path) -> Result<Self> {
        let file: QueryLogFile = if path.exists() {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        } else {
            QueryLogFile::default()
        };
        let miner = Self { path: Some(path.to_path_buf()), recorded: AtomicU64::new(file.recorded), ..Self::default() };
        miner.replay(file.queries);
        Ok(miner)
    }

    pub fn with_export_every(mut self, n: u64) -> Self {
        self.export_every = n.max(1);
        self
    }

    pub fn with_max_log(mut self, n: usize) -> Self {
        self.max_log = n.max(1);
        let queries: Vec<LoggedQuery> = self.log.get_mut().map(|log| log.drain(..).collect()).unwrap_or_default();
        self.stats.clear();
        self.replay(queries);
        self
    }

    fn replay(&self, queries: Vec<LoggedQuery>) {
        let Ok(mut log) = self.log.lock() else { return };
        for query in queries {
            self.push(&mut log, query);
        }
    }

    /// Append to the log, evicting the oldest entries past `max_log`.
    fn push(&self, log: &mut VecDeque<LoggedQuery>, query: LoggedQuery) {
        for term in &query.terms {
            let mut entry = self.stats.entry(term.clone()).or_default();
            for doc in &query.documents {
                *entry.documents.entry(doc.clone()).or_default() += 1;
            }
            entry.count += 1;
        }
        log.push_back(query);
        while log.len() > self.max_log {
            let Some(old) = log.pop_front() else { break };
            self.withdraw(&old);
        }
    }

    fn withdraw(&self, query: &LoggedQuery) {
        for term in &query.terms {
            let Some(mut entry) = self.stats.get_mut(term) else { continue };
            for doc in &query.documents {
                if let Some(n) = entry.documents.get_mut(doc) {
                    *n -= 1;
                    if *n == 0 {
                        entry.documents.remove(doc);
                    }
                }
            }
            entry.count = entry.count.saturating_sub(1);
            let empty = entry.count == 0;
            drop(entry);
            if empty {
                self.stats.remove(term);
            }
        }
    }

    fn keywords(query: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        tokens(query)
            .into_iter()
            .filter(|w| w.chars().count() > 2 && !is_stop_word(w))
            .filter(|w| seen.insert(w.clone()))
            .collect()
    }

    /// Number of queries currently held in the log.
    pub fn logged(&self) -> usize {
        self.log.lock().map(|log| log.len()).unwrap_or(0)
    }

    pub fn tracked_terms(&self) -> usize {
        self.stats.len()
    }

    /// Record one answered query. Returns `true` when an export is due.
    pub fn record(&self, query: &str, document_ids: &[String]) -> bool {
        let mut documents = document_ids.to_vec();
        documents.sort();
        documents.dedup();
        let entry = LoggedQuery { terms: Self::keywords(query), documents };
        match self.log.lock() {
            Ok(mut log) => self.push(&mut log, entry),
            Err(_) => {
                tracing::warn!(stage = "query_miner", "query log lock poisoned, query not recorded");
                return false;
            }
        }
        let n = self.recorded.fetch_add(1, Ordering::AcqRel) + 1;
        n % self.export_every == 0
    }

    /// Write the query log to its bound path, if any.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let log = self.log.lock().map_err(|_| anyhow::anyhow!("query log lock poisoned"))?;
        let file = QueryLogFile { recorded: self.recorded.load(Ordering::Acquire), queries: log.iter().cloned().collect() };
        write_json_atomic(path, &file)
    }

    pub fn find_synonyms(&self, term: &str) -> Vec<String> {
        let term = normalize(term);
        // Clone out so no shard guard is held while iterating the map.
        let Some(own) = self.stats.get(&term).map(|e| e.documents.keys().cloned().collect::<HashSet<String>>()) else {
            return vec![];
        };
        if own.len() < self.min_documents {
            return vec![];
        }
        let mut scored: Vec<(String, f32)> = self
            .stats
            .iter()
            .filter(|e| *e.key() != term && e.value().documents.len() >= self.min_documents)
            .filter_map(|e| {
                let other = &e.value().documents;
                let inter = own.iter().filter(|d| other.contains_key(*d)).count();
                let union = own.len() + other.len() - inter;
                #[allow(clippy::cast_precision_loss)]
                let jaccard = if union == 0 { 0.0 } else { inter as f32 / union as f32 };
                (jaccard >= self.jaccard_threshold).then(|| (e.key().clone(), jaccard))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.into_iter().take(self.max_synonyms).map(|(t, _)| t).collect()
    }

    /// Publish every term with enough evidence into `table`. Returns how many
    /// entries actually changed; an unchanged table keeps its version.
    pub fn export(&self, table: &LearnedTerms) -> usize {
        let candidates: Vec<String> = self
            .stats
            .iter()
            .filter(|e| e.value().count >= self.min_count)
            .map(|e| e.key().clone())
            .collect();
        let mut changed = 0;
        for term in candidates {
            let synonyms = self.find_synonyms(&term);
            if !synonyms.is_empty() && table.insert(&term, synonyms) {
                changed += 1;
            }
        }
        tracing::info!(stage = "query_miner", changed, version = table.version(), "learned synonyms exported");
        changed
    }
}
