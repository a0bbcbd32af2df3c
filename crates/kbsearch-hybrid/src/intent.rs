//! Rule-based intent classification.
//!
//! Each intent accumulates points from lexical cues; the single highest
//! score wins. A tie at the top, or no cue at all, resolves to
//! [`Intent::Exploratory`], the most permissive configuration.

use std::collections::HashSet;

use kbsearch_core::text::{normalize, tokens};
use kbsearch_core::types::{Intent, ScorerFamily};

use crate::rerank::ThresholdTable;

const NAVIGATIONAL_WORDS: &[&str] = &["where", "find", "link", "url", "page", "document", "doc", "show", "open", "locate"];
const HOWTO_PHRASES: &[&str] = &["how to", "how do", "how can", "how should", "step by step"];
const HOWTO_WORDS: &[&str] = &["steps", "guide", "tutorial", "instructions", "procedure", "process", "setup"];
/// Imperative verbs that mark a task-oriented query when they lead it.
const IMPERATIVE_VERBS: &[&str] = &[
    "deploy", "install", "configure", "set", "setup", "run", "start", "stop", "restart", "create", "enable", "disable",
    "update", "upgrade", "build", "rotate", "migrate", "connect", "add", "remove", "reset", "fix",
];
const FACTUAL_WORDS: &[&str] = &["what", "when", "who", "which", "why", "is", "are", "does", "define", "meaning"];
const FACTUAL_PHRASES: &[&str] = &["how many", "how much", "how long"];
const EXPLORATORY_WORDS: &[&str] = &["compare", "list", "all", "overview", "options", "vs", "versus", "alternatives", "explore", "ideas", "difference", "examples"];
const STRUCTURAL_PHRASES: &[&str] = &["in space", "under section", "pages under", "child pages", "labeled", "labelled", "tagged"];
const STRUCTURAL_WORDS: &[&str] = &["under", "section", "subpages", "children"];

/// Per-intent knobs consumed by the downstream stages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntentProfile {
    pub intent: Intent,
    /// Scales the candidate pool.
    pub limit_multiplier: f32,
    /// Minimum rerank score, in the active scorer family's scale.
    pub rerank_threshold: f32,
    /// Neighbour chunks fetched on each side of a result.
    pub context_window: u32,
    /// Maximum results from one document.
    pub diversity_cap: usize,
}

impl IntentProfile {
    pub fn new(intent: Intent, thresholds: &ThresholdTable, family: ScorerFamily) -> Self {
        let (limit_multiplier, context_window, diversity_cap) = match intent {
            Intent::Navigational => (1.0, 2, 1),
            Intent::Factual => (1.0, 3, 2),
            Intent::HowTo => (1.2, 3, 3),
            Intent::Exploratory => (1.5, 4, 4),
            Intent::Structural => (1.5, 1, 3),
        };
        Self { intent, limit_multiplier, rerank_threshold: thresholds.get(family, intent), context_window, diversity_cap }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IntentClassifier {
    /// Lowercased titles (documents, spaces) that mark a navigational lookup.
    known_titles: HashSet<String>,
}

impl IntentClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known_titles<I, S>(mut self, titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.known_titles.extend(titles.into_iter().map(|t| normalize(t.as_ref())).filter(|t| !t.is_empty()));
        self
    }

    /// Per-intent cue scores in [`Intent::ALL`] order.
    pub fn scores(&self, query: &str) -> [u32; 5] {
        let text = normalize(query);
        let words = tokens(&text);
        let has_word = |list: &[&str]| -> u32 { u32::try_from(words.iter().filter(|w| list.contains(&w.as_str())).count()).unwrap_or(u32::MAX) };
        let has_phrase = |list: &[&str]| -> u32 { u32::try_from(list.iter().filter(|p| contains_phrase(&text, p)).count()).unwrap_or(u32::MAX) };

        let mut navigational = has_word(NAVIGATIONAL_WORDS);
        if self.known_titles.iter().any(|t| contains_phrase(&text, t)) {
            navigational += 2;
        }

        let mut howto = 2 * has_phrase(HOWTO_PHRASES) + has_word(HOWTO_WORDS);
        if words.first().is_some_and(|w| IMPERATIVE_VERBS.contains(&w.as_str())) {
            howto += 2;
        }

        let mut factual = has_word(FACTUAL_WORDS) + 2 * has_phrase(FACTUAL_PHRASES);
        if query.trim_end().ends_with('?') {
            factual += 1;
        }

        let exploratory = has_word(EXPLORATORY_WORDS);

        let mut structural = 2 * has_phrase(STRUCTURAL_PHRASES) + has_word(STRUCTURAL_WORDS);
        if query.contains('>') {
            structural += 3;
        }

        [navigational, factual, howto, exploratory, structural]
    }

    pub fn classify(&self, query: &str) -> Intent {
        let scores = self.scores(query);
        let best = scores.iter().copied().max().unwrap_or(0);
        if best == 0 || scores.iter().filter(|&&s| s == best).count() > 1 {
            return Intent::Exploratory;
        }
        Intent::ALL
            .iter()
            .zip(scores)
            .find(|(_, s)| *s == best)
            .map_or(Intent::Exploratory, |(i, _)| *i)
    }
}

/// Whole-word phrase containment over normalized text.
fn contains_phrase(text: &str, phrase: &str) -> bool {
    text.match_indices(phrase).any(|(idx, _)| {
        let before = text[..idx].chars().next_back();
        let after = text[idx + phrase.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}
