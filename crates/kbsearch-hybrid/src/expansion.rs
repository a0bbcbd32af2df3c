//! Query expansion into a bounded, ordered set of variants.

use regex::{NoExpand, Regex};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use kbsearch_core::config::ExpansionSettings;
use kbsearch_core::text::{normalize, tokens};
use kbsearch_core::types::{Intent, QueryVariant, QueryVariants, VariantSource};

use crate::synonyms::LearnedTerms;

struct SynonymRule {
    term: String,
    pattern: Regex,
    substitutes: Vec<String>,
}

fn word_pattern(term: &str) -> Option<Regex> {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term))).ok()
}

pub struct QueryExpander {
    rules: Vec<SynonymRule>,
    learned: Arc<LearnedTerms>,
    protected: HashSet<String>,
    max_variants: usize,
    space_context_max_tokens: usize,
    config_version: u64,
}

impl QueryExpander {
    pub fn new(settings: &ExpansionSettings, synonyms: BTreeMap<String, Vec<String>>, learned: Arc<LearnedTerms>) -> Self {
        let protected: HashSet<String> = settings.blacklist.iter().map(|t| normalize(t)).collect();
        let rules = synonyms
            .into_iter()
            .map(|(term, subs)| (normalize(&term), subs))
            .filter(|(term, _)| !term.is_empty() && !protected.contains(term))
            .filter_map(|(term, substitutes)| word_pattern(&term).map(|pattern| SynonymRule { term, pattern, substitutes }))
            .collect();
        Self {
            rules,
            learned,
            protected,
            max_variants: settings.max_variants.max(1),
            space_context_max_tokens: settings.space_context_max_tokens,
            config_version: settings.config_version,
        }
    }

    /// Terms that must never be substituted, e.g. tool names and space keys.
    pub fn protect<I, S>(&mut self, terms: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.protected.extend(terms.into_iter().map(|t| normalize(t.as_ref())));
        let protected = &self.protected;
        self.rules.retain(|r| !protected.contains(&r.term));
    }

    /// Combined version of the static configuration and the learned table.
    pub fn version(&self) -> String {
        format!("{}.{}", self.config_version, self.learned.version())
    }

    fn budget(&self, intent: Intent) -> usize {
        match intent {
            // Exact-title and path lookups gain little from paraphrase.
            Intent::Navigational | Intent::Structural => self.max_variants.min(2),
            Intent::Factual => self.max_variants.min(4),
            Intent::HowTo | Intent::Exploratory => self.max_variants,
        }
    }

    fn allowed(&self, substitute: &str) -> bool {
        !self.protected.contains(&normalize(substitute))
    }

    /// Original first, then rewrite, curated synonyms, learned terms and the
    /// space qualifier, stopping as soon as the budget is spent.
    pub fn expand(&self, query: &str, intent: Intent, space: Option<&str>, rewritten: Option<&str>) -> QueryVariants {
        let mut variants = QueryVariants::new(query, self.budget(intent));

        if let Some(r) = rewritten {
            variants.push(QueryVariant::new(r, VariantSource::Rewritten));
        }

        for rule in &self.rules {
            if variants.is_full() {
                return variants;
            }
            if !rule.pattern.is_match(query) {
                continue;
            }
            for sub in rule.substitutes.iter().filter(|s| self.allowed(s)) {
                let text = rule.pattern.replace_all(query, NoExpand(sub));
                variants.push(QueryVariant::new(text, VariantSource::Synonym));
            }
        }

        let mut seen = HashSet::new();
        for token in tokens(query) {
            if variants.is_full() {
                return variants;
            }
            if self.protected.contains(&token) || !seen.insert(token.clone()) {
                continue;
            }
            let (Some(subs), Some(pattern)) = (self.learned.get(&token), word_pattern(&token)) else { continue };
            for sub in subs.iter().filter(|s| self.allowed(s)) {
                let text = pattern.replace_all(query, NoExpand(sub));
                variants.push(QueryVariant::new(text, VariantSource::DomainTerm));
            }
        }

        if let Some(space) = space {
            let short = tokens(query).len() <= self.space_context_max_tokens;
            let mentioned = tokens(query).iter().any(|t| t.eq_ignore_ascii_case(space));
            if short && !mentioned {
                variants.push(QueryVariant::new(format!("{query} {space}"), VariantSource::SpaceContext));
            }
        }
        variants
    }
}
