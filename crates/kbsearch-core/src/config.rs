//! Configuration loader, typed search settings and path helpers.
//!
//! Uses Figment to merge `config.toml` + `config.<env>.toml` + `APP_*` env vars.
//! Nested keys are addressed from the environment with a double underscore,
//! e.g. `APP_SEARCH__RETRIEVAL__RRF_K=30`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::types::{Intent, ScorerFamily};

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::new().merge(Toml::file("config.toml"));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));

        let config = Self { figment };
        config.settings()?.validate()?;
        Ok(config)
    }

    /// Build a config from an explicit figment (tests, embedding callers).
    pub fn from_figment(figment: Figment) -> Self {
        Self { figment }
    }

    pub fn get<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| anyhow::anyhow!("Failed to get '{}': {}", key, e))
    }

    /// Typed pipeline settings from the `search` table, with every missing
    /// key falling back to [`SearchSettings::default`].
    pub fn settings(&self) -> anyhow::Result<SearchSettings> {
        let settings: SearchSettings = Figment::from(Serialized::defaults(SearchSettings::default()))
            .merge(self.figment.focus("search"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to read search settings: {}", e))?;
        Ok(settings)
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
/// If `p` is absolute, it's returned as-is; otherwise `base.join(p)` is returned.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub retrieval: RetrievalSettings,
    pub expansion: ExpansionSettings,
    pub rerank: RerankSettings,
    pub context: ContextSettings,
    pub diversity: DiversitySettings,
    pub grounding: GroundingSettings,
    pub fallback: FallbackSettings,
    pub cache: CacheSettings,
    pub rewriter: RewriterSettings,
    pub limits: LimitSettings,
}

impl SearchSettings {
    pub fn validate(&self) -> crate::Result<()> {
        let bad = |msg: &str| Err(crate::Error::InvalidConfig(msg.to_string()));
        if self.retrieval.rrf_k == 0 {
            return bad("search.retrieval.rrf_k must be positive");
        }
        if self.retrieval.min_pool == 0 || self.retrieval.min_pool > self.retrieval.max_pool {
            return bad("search.retrieval.min_pool must be within 1..=max_pool");
        }
        if self.expansion.max_variants == 0 {
            return bad("search.expansion.max_variants must be at least 1");
        }
        if self.rerank.batch_size == 0 {
            return bad("search.rerank.batch_size must be at least 1");
        }
        let w = self.grounding.keyword_weight + self.grounding.semantic_weight;
        if self.grounding.keyword_weight < 0.0 || self.grounding.semantic_weight < 0.0 || w <= 0.0 {
            return bad("search.grounding weights must be non-negative and not both zero");
        }
        if !(0.0..=1.0).contains(&self.diversity.near_duplicate_threshold) {
            return bad("search.diversity.near_duplicate_threshold must be within 0..=1");
        }
        if self.limits.min_query_chars > self.limits.max_query_chars || self.limits.max_limit == 0 {
            return bad("search.limits are inconsistent");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// RRF damping constant.
    pub rrf_k: u32,
    pub per_call_timeout_ms: u64,
    pub max_pool: usize,
    pub min_pool: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self { rrf_k: 60, per_call_timeout_ms: 2000, max_pool: 50, min_pool: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionSettings {
    pub max_variants: usize,
    /// Bumped whenever synonym tables change; part of the cache fingerprint.
    pub config_version: u64,
    pub space_context_max_tokens: usize,
    pub blacklist: Vec<String>,
    pub synonyms: std::collections::BTreeMap<String, Vec<String>>,
}

impl Default for ExpansionSettings {
    fn default() -> Self {
        // Proper names of tools and products; substituting them changes meaning.
        let blacklist = [
            "confluence", "jira", "bitbucket", "github", "gitlab", "docker", "kubernetes", "postgres", "mysql",
            "redis", "ollama", "openrouter", "litellm", "mcp", "rag", "llm", "gpt", "claude", "chatgpt",
        ]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        Self {
            max_variants: 5,
            config_version: 1,
            space_context_max_tokens: 5,
            blacklist,
            synonyms: std::collections::BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankSettings {
    pub family: ScorerFamily,
    pub enabled: bool,
    pub batch_size: usize,
    pub timeout_ms: u64,
    pub url: String,
    /// Per-intent threshold overrides for the configured family.
    pub thresholds: std::collections::BTreeMap<Intent, f32>,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self {
            family: ScorerFamily::Bge,
            enabled: true,
            batch_size: 16,
            timeout_ms: 5000,
            url: "http://localhost:8080".to_string(),
            thresholds: std::collections::BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    pub enabled: bool,
    pub max_chars: usize,
    pub timeout_ms: u64,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self { enabled: true, max_chars: 4000, timeout_ms: 1500 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiversitySettings {
    pub enabled: bool,
    pub near_duplicate_threshold: f32,
}

impl Default for DiversitySettings {
    fn default() -> Self {
        Self { enabled: true, near_duplicate_threshold: 0.9 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroundingSettings {
    pub keyword_weight: f32,
    pub semantic_weight: f32,
    pub grounded_cutoff: f32,
}

impl Default for GroundingSettings {
    fn default() -> Self {
        Self { keyword_weight: 0.4, semantic_weight: 0.6, grounded_cutoff: 0.5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackSettings {
    pub min_results: usize,
    pub relax_margin: f32,
    pub relaxed_pool_bonus: usize,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self { min_results: 1, relax_margin: 0.005, relaxed_pool_bonus: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: u64,
    pub backing_dir: Option<String>,
    pub corpus_version: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { enabled: true, ttl_secs: 3600, max_entries: 10_000, backing_dir: None, corpus_version: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriterSettings {
    pub enabled: bool,
    pub url: String,
    pub model: String,
    pub timeout_ms: u64,
}

impl Default for RewriterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub max_query_chars: usize,
    pub min_query_chars: usize,
    pub max_limit: usize,
    pub default_limit: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self { max_query_chars: 1000, min_query_chars: 2, max_limit: 20, default_limit: 5 }
    }
}
