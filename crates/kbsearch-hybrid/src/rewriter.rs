//! Best-effort query rewriting through a text-generation service.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use kbsearch_core::config::RewriterSettings;
use kbsearch_core::text::normalize;
use kbsearch_core::traits::TextRewriter;

/// Result of a rewrite attempt. Never an error: failures are `Degraded`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteOutcome {
    Rewritten(String),
    Unchanged,
    Degraded(String),
}

impl RewriteOutcome {
    pub fn rewritten(&self) -> Option<&str> {
        match self {
            RewriteOutcome::Rewritten(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, RewriteOutcome::Degraded(_))
    }
}

/// Run `rewriter` under `timeout`, folding every failure into the outcome.
pub async fn rewrite_best_effort(rewriter: &dyn TextRewriter, query: &str, timeout: Duration) -> RewriteOutcome {
    let outcome = match tokio::time::timeout(timeout, rewriter.rewrite(query)).await {
        Err(_) => RewriteOutcome::Degraded(format!("timed out after {}ms", timeout.as_millis())),
        Ok(Err(e)) => RewriteOutcome::Degraded(e.to_string()),
        Ok(Ok(raw)) => match clean_rewrite(&raw) {
            Some(text) if normalize(&text) != normalize(query) => RewriteOutcome::Rewritten(text),
            Some(_) => RewriteOutcome::Unchanged,
            None => RewriteOutcome::Degraded("empty or malformed rewrite".to_string()),
        },
    };
    match &outcome {
        RewriteOutcome::Rewritten(text) => tracing::info!(stage = "rewrite", original = query, rewritten = %text, "query rewritten"),
        RewriteOutcome::Unchanged => tracing::debug!(stage = "rewrite", "rewrite returned the original query"),
        RewriteOutcome::Degraded(reason) => tracing::warn!(stage = "rewrite", %reason, "rewriter unavailable, using original query"),
    }
    outcome
}

/// First usable line of generated text, without list markers or quotes.
pub fn clean_rewrite(raw: &str) -> Option<String> {
    raw.lines()
        .map(|line| {
            let line = line.trim();
            let line = line.trim_start_matches(|c: char| c.is_ascii_digit());
            let line = line.trim_start_matches(['.', ')', '-', '*', '•']).trim();
            line.trim_matches(['"', '\'', '`']).trim().to_string()
        })
        .find(|line| line.chars().count() > 2)
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Deserialize, Debug)]
struct OllamaGenerateResponse {
    response: String,
}

/// Ollama `/api/generate` client.
pub struct OllamaRewriter {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaRewriter {
    pub fn new(settings: &RewriterSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .context("building rewriter HTTP client")?;
        Ok(Self { client, url: settings.url.trim_end_matches('/').to_string(), model: settings.model.clone() })
    }

    fn prompt(query: &str) -> String {
        format!(
            "Rewrite the following search query so it is clear and correctly spelled. \
             Keep product names and abbreviations unchanged. Reply with the rewritten query only.\n\nQuery: {query}"
        )
    }
}

#[async_trait]
impl TextRewriter for OllamaRewriter {
    async fn rewrite(&self, text: &str) -> Result<String> {
        let body = OllamaGenerateRequest {
            model: &self.model,
            prompt: Self::prompt(text),
            stream: false,
            options: OllamaOptions { temperature: 0.1, num_predict: 64 },
        };
        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await
            .context("rewrite request failed")?
            .error_for_status()
            .context("rewrite service returned an error status")?;
        let parsed: OllamaGenerateResponse = response.json().await.context("malformed rewrite response")?;
        Ok(parsed.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<String, String>, Duration);

    #[async_trait]
    impl TextRewriter for Fixed {
        async fn rewrite(&self, _text: &str) -> Result<String> {
            tokio::time::sleep(self.1).await;
            self.0.clone().map_err(anyhow::Error::msg)
        }
    }

    #[test]
    fn clean_strips_numbering_and_quotes() {
        assert_eq!(clean_rewrite("1. \"deploy process\"\n2. other").as_deref(), Some("deploy process"));
        assert_eq!(clean_rewrite("\n  - rotate api keys").as_deref(), Some("rotate api keys"));
        assert_eq!(clean_rewrite("ok\n\n"), None);
    }

    #[tokio::test]
    async fn outcomes() {
        let fast = Duration::from_millis(0);
        let ok = Fixed(Ok("deploy process".into()), fast);
        assert_eq!(rewrite_best_effort(&ok, "dploy proces", Duration::from_secs(1)).await, RewriteOutcome::Rewritten("deploy process".into()));
        assert_eq!(rewrite_best_effort(&ok, "Deploy  Process", Duration::from_secs(1)).await, RewriteOutcome::Unchanged);

        let failing = Fixed(Err("503".into()), fast);
        assert!(rewrite_best_effort(&failing, "q", Duration::from_secs(1)).await.is_degraded());

        let slow = Fixed(Ok("late".into()), Duration::from_millis(200));
        assert!(rewrite_best_effort(&slow, "q", Duration::from_millis(10)).await.is_degraded());
    }
}
