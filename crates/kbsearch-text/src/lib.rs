//! kbsearch-text
//!
//! Tantivy-backed lexical channel. Chunks are indexed with their space,
//! section path and labels so hard filters run inside the index.
pub mod tantivy_utils;
pub mod index;

pub use index::TantivyLexicalIndex;
