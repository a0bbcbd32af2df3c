//! Hybrid retrieval pipeline: intent-aware expansion, dual-channel
//! retrieval, reciprocal rank fusion, reranking and tiered fallback.

pub mod cache;
pub mod context;
pub mod diversity;
pub mod expansion;
pub mod fallback;
pub mod fusion;
pub mod grounding;
pub mod intent;
pub mod limits;
pub mod pipeline;
pub mod rerank;
pub mod retrieval;
pub mod rewriter;
pub mod structural;
pub mod synonyms;

pub use cache::{CacheStats, DirectoryBackingStore, SemanticCache};
pub use grounding::AnswerCheck;
pub use pipeline::{HybridSearchEngine, RetrievalContext};
pub use rerank::HttpCrossEncoder;
pub use rewriter::OllamaRewriter;
pub use synonyms::{query_log_path, DomainTerms, LearnedTerms, QueryMiner};
