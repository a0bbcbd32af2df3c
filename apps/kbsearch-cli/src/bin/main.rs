use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kbsearch_core::config::{expand_path, resolve_with_base, Config, SearchSettings};
use kbsearch_core::loader::ChunkLoader;
use kbsearch_core::traits::{CacheBackingStore, EmbeddingProvider, PairwiseReranker, TextRewriter};
use kbsearch_core::types::{Query, SearchResponse};
use kbsearch_embed::get_default_embedder;
use kbsearch_hybrid::{query_log_path, DirectoryBackingStore, DomainTerms, HttpCrossEncoder, HybridSearchEngine, LearnedTerms, OllamaRewriter, QueryMiner, RetrievalContext};
use kbsearch_text::TantivyLexicalIndex;
use kbsearch_vector::LanceChunkIndex;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage:
  kbsearch load <chunks.jsonl>
  kbsearch search \"<query>\" [--limit N] [--space KEY] [--answer TEXT]
  kbsearch spaces";

struct Paths {
    tantivy: PathBuf,
    lancedb: PathBuf,
    learned_terms: PathBuf,
}

impl Paths {
    /// Relative store paths resolve against `data.root` (default: the working directory).
    fn from_config(config: &Config) -> Self {
        let root = expand_path(config.get::<String>("data.root").unwrap_or_else(|_| ".".to_string()));
        let path = |key: &str, default: &str| resolve_with_base(&root, config.get::<String>(key).unwrap_or_else(|_| default.to_string()));
        Self {
            tantivy: path("data.tantivy_index_dir", "./data/indexes/tantivy"),
            lancedb: path("data.lancedb_index_dir", "./data/indexes/lancedb"),
            learned_terms: path("data.learned_terms_path", "./data/learned_terms.json"),
        }
    }
}

struct SearchArgs {
    query: String,
    limit: Option<usize>,
    space: Option<String>,
    answer: Option<String>,
}

fn parse_search_args(args: &[String]) -> anyhow::Result<SearchArgs> {
    let mut parsed = SearchArgs { query: String::new(), limit: None, space: None, answer: None };
    let mut words = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let value = |i: usize| args.get(i + 1).cloned().ok_or_else(|| anyhow::anyhow!("{} requires a value", args[i]));
        match args[i].as_str() {
            "--limit" | "-n" => {
                parsed.limit = Some(value(i)?.parse().map_err(|_| anyhow::anyhow!("--limit requires a number"))?);
                i += 1;
            }
            "--space" | "-s" => {
                parsed.space = Some(value(i)?);
                i += 1;
            }
            "--answer" => {
                parsed.answer = Some(value(i)?);
                i += 1;
            }
            other => words.push(other.to_string()),
        }
        i += 1;
    }
    parsed.query = words.join(" ");
    Ok(parsed)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,kbsearch=info,kbsearch_hybrid=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::load().map_err(|e| {
        eprintln!("Error loading config: {e}");
        e
    })?;
    let settings = config.settings()?;
    let paths = Paths::from_config(&config);

    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("{USAGE}");
        std::process::exit(1);
    }
    let cmd = args.remove(0);
    let rt = tokio::runtime::Runtime::new()?;
    match cmd.as_str() {
        "load" => {
            let Some(file) = args.first() else {
                eprintln!("{USAGE}");
                std::process::exit(1);
            };
            rt.block_on(load(Path::new(file), &paths))
        }
        "search" => {
            let search = parse_search_args(&args)?;
            rt.block_on(search_cmd(search, settings, &paths))
        }
        "spaces" => spaces(&paths),
        _ => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
    }
}

async fn load(file: &Path, paths: &Paths) -> anyhow::Result<()> {
    let chunks = ChunkLoader::new().load_file(file)?;
    tracing::info!(chunks = chunks.len(), file = %file.display(), "chunks loaded");

    let lexical = TantivyLexicalIndex::create(&paths.tantivy)?;
    let indexed = lexical.index(&chunks)?;
    tracing::info!(indexed, dir = %paths.tantivy.display(), "tantivy index written");

    let embedder = get_default_embedder()?;
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let embeddings = embedder.embed_batch(&texts).await?;

    if paths.lancedb.exists() {
        std::fs::remove_dir_all(&paths.lancedb)?;
    }
    std::fs::create_dir_all(&paths.lancedb)?;
    let dense = LanceChunkIndex::open(&paths.lancedb.to_string_lossy(), embedder.dim()).await?;
    let written = dense.writer()?.with_progress().insert(&chunks, &embeddings).await?;
    tracing::info!(written, dir = %paths.lancedb.display(), "lancedb vectors written");

    let domain = DomainTerms::mine(&chunks);
    let learned = LearnedTerms::load(&paths.learned_terms)?;
    learned.merge_domain_terms(&domain);
    learned.persist()?;
    tracing::info!(version = learned.version(), terms = learned.len(), "learned terms persisted");
    println!("Loaded {} chunks; learned {} domain terms across {} spaces", chunks.len(), domain.abbreviations.len(), domain.spaces.len());
    Ok(())
}

async fn search_cmd(args: SearchArgs, settings: SearchSettings, paths: &Paths) -> anyhow::Result<()> {
    let lexical = TantivyLexicalIndex::open(&paths.tantivy)?;
    let spaces: Vec<String> = lexical.space_counts()?.into_iter().map(|(s, _)| s).collect();
    let embedder = get_default_embedder()?;
    let dense = Arc::new(LanceChunkIndex::open(&paths.lancedb.to_string_lossy(), embedder.dim()).await?);
    let learned = Arc::new(LearnedTerms::load(&paths.learned_terms)?);
    let miner = Arc::new(QueryMiner::load(&query_log_path(&paths.learned_terms))?);
    tracing::debug!(logged = miner.logged(), learned_version = learned.version(), "learning state loaded");

    let mut ctx = RetrievalContext::new(settings.clone(), dense.clone(), Arc::new(lexical), embedder, dense)
        .with_learned_terms(learned)
        .with_query_miner(miner)
        .with_known_spaces(spaces);
    if settings.rerank.enabled {
        let reranker: Arc<dyn PairwiseReranker> = Arc::new(HttpCrossEncoder::new(&settings.rerank)?);
        ctx = ctx.with_reranker(reranker);
    }
    if settings.rewriter.enabled {
        let rewriter: Arc<dyn TextRewriter> = Arc::new(OllamaRewriter::new(&settings.rewriter)?);
        ctx = ctx.with_rewriter(rewriter);
    }
    if let Some(dir) = &settings.cache.backing_dir {
        let backing: Arc<dyn CacheBackingStore> = Arc::new(DirectoryBackingStore::new(expand_path(dir))?);
        ctx = ctx.with_cache_backing(backing);
    }
    let engine = HybridSearchEngine::new(ctx)?;

    let mut query = Query::new(&args.query);
    query.limit = args.limit;
    query.space = args.space;
    query.answer = args.answer.clone();
    let response = engine.search(query).await?;
    // The query log is written in the background; let it land before exit.
    engine.flush_learning().await;
    print_response(&args.query, &response);

    if let Some(answer) = &args.answer {
        let check = engine.check_answer(&args.query, answer, &response.results).await;
        println!(
            "\nAnswer check: {:?} confidence={:.3} keywords={:.3} sentences={:.3}",
            check.label, check.confidence, check.keyword_overlap, check.sentence_support
        );
    }
    Ok(())
}

fn print_response(query: &str, response: &SearchResponse) {
    println!("Query: {query}");
    println!("Intent: {}  Tier: {}{}", response.intent, response.tier, if response.from_cache { "  (cached)" } else { "" });
    if response.degraded.any() {
        println!("Degraded: {:?}", response.degraded);
    }
    if let Some(reason) = response.empty_reason {
        println!("\n{reason}");
        return;
    }
    for (i, r) in response.results.iter().enumerate() {
        let rerank = r.rerank_score.map(|s| format!(" rerank={s:.4}")).unwrap_or_default();
        let grounding = r.grounding.as_ref().map(|g| format!(" {:?}={:.2}", g.label, g.confidence)).unwrap_or_default();
        println!("\n  {}. {}  fused={:.5}{}{}", i + 1, r.source_path, r.fused_score, rerank, grounding);
        let mut channels: Vec<String> = r.sources.iter().map(|c| format!("{:?}", c.channel).to_lowercase()).collect();
        channels.dedup();
        println!("     id={}  via {}", r.chunk.id, channels.join("+"));
        let preview: String = r.expanded_text.chars().take(240).collect();
        println!("     {}", preview.replace('\n', " "));
    }
}

fn spaces(paths: &Paths) -> anyhow::Result<()> {
    let lexical = TantivyLexicalIndex::open(&paths.tantivy)?;
    let counts = lexical.space_counts()?;
    println!("{} spaces, {} chunks", counts.len(), lexical.num_docs());
    for (space, count) in counts {
        println!("  {space}: {count}");
    }
    Ok(())
}
