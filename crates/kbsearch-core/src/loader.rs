//! JSONL chunk ingestion.
//!
//! One [`Chunk`] per line. Blank lines are skipped; a missing `token_count`
//! is estimated from the word count.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::types::Chunk;

#[derive(Debug, Default)]
pub struct ChunkLoader {
    /// Stop after this many chunks.
    limit: Option<usize>,
}

impl ChunkLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn load_file(&self, path: &Path) -> Result<Vec<Chunk>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => String::from_utf8_lossy(
                &fs::read(path).with_context(|| format!("reading {}", path.display()))?,
            )
            .to_string(),
        };
        self.parse(&content)
            .with_context(|| format!("parsing chunks from {}", path.display()))
    }

    pub fn parse(&self, content: &str) -> Result<Vec<Chunk>> {
        let mut seen = HashSet::new();
        let mut chunks = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if self.limit.is_some_and(|l| chunks.len() >= l) {
                break;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut chunk: Chunk = serde_json::from_str(line)
                .with_context(|| format!("line {}: malformed chunk", line_no + 1))?;
            if chunk.id.is_empty() || chunk.document_id.is_empty() {
                anyhow::bail!("line {}: chunk id and document_id are required", line_no + 1);
            }
            if !seen.insert(chunk.id.clone()) {
                anyhow::bail!("line {}: duplicate chunk id '{}'", line_no + 1, chunk.id);
            }
            if chunk.token_count == 0 {
                chunk.token_count = estimate_tokens(&chunk.text);
            }
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

/// Rough token estimate: about 0.75 words per token.
pub fn estimate_tokens(text: &str) -> u32 {
    let words = text.split_whitespace().count();
    u32::try_from(words * 4 / 3).unwrap_or(u32::MAX)
}
