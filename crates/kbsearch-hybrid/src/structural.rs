//! Structural query recognition.
//!
//! Recognizers run in a fixed order and the first one that matches produces
//! the filter. A query no recognizer accepts is plain semantic search.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use kbsearch_core::types::SearchFilter;

static RE_SECTION_IN_SPACE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:under|section)\s+(?:section\s+)?["']?([^"']+?)["']?\s+(?:in|of)\s+space\s+["']?([A-Za-z0-9_-]+)"#).ok()
});
static RE_UNDER_SECTION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:(?:pages?|docs?|documents?)\s+under|under\s+section)\s+["']?([^"']+?)["']?\s*$"#).ok()
});
static RE_IN_SPACE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:(?:in|from)\s+space|space:)\s*["']?([A-Za-z0-9_-]+)["']?"#).ok()
});
static RE_LABELS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:labell?ed|tagged|with\s+labels?)\s+["']?([A-Za-z0-9_-]+(?:\s*(?:,|and)\s*[A-Za-z0-9_-]+)*)"#).ok()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recognizer {
    PathSeparator,
    SectionInSpace,
    UnderSection,
    InSpace,
    Labels,
}

impl Recognizer {
    pub const ORDER: [Recognizer; 5] = [
        Recognizer::PathSeparator,
        Recognizer::SectionInSpace,
        Recognizer::UnderSection,
        Recognizer::InSpace,
        Recognizer::Labels,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Recognizer::PathSeparator => "path_separator",
            Recognizer::SectionInSpace => "section_in_space",
            Recognizer::UnderSection => "under_section",
            Recognizer::InSpace => "in_space",
            Recognizer::Labels => "labels",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralMatch {
    pub recognizer: Recognizer,
    pub filter: SearchFilter,
}

#[derive(Debug, Clone, Default)]
pub struct StructuralParser {
    known_spaces: HashSet<String>,
}

impl StructuralParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Space keys that may lead a `A > B > C` path.
    pub fn with_known_spaces<I, S>(mut self, spaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.known_spaces.extend(spaces.into_iter().map(|s| s.as_ref().to_lowercase()));
        self
    }

    pub fn parse(&self, query: &str) -> Option<StructuralMatch> {
        Recognizer::ORDER.iter().find_map(|r| {
            self.recognize(*r, query).filter(|f| !f.is_empty()).map(|filter| StructuralMatch { recognizer: *r, filter })
        })
    }

    fn recognize(&self, recognizer: Recognizer, query: &str) -> Option<SearchFilter> {
        match recognizer {
            Recognizer::PathSeparator => self.path_separator(query),
            Recognizer::SectionInSpace => {
                let caps = RE_SECTION_IN_SPACE.as_ref()?.captures(query)?;
                Some(SearchFilter {
                    space: Some(caps[2].to_string()),
                    path_prefix: vec![caps[1].trim().to_string()],
                    labels: vec![],
                })
            }
            Recognizer::UnderSection => {
                let caps = RE_UNDER_SECTION.as_ref()?.captures(query)?;
                Some(SearchFilter { path_prefix: split_path(&caps[1]), ..SearchFilter::default() })
            }
            Recognizer::InSpace => {
                let caps = RE_IN_SPACE.as_ref()?.captures(query)?;
                Some(SearchFilter::for_space(&caps[1]))
            }
            Recognizer::Labels => {
                let caps = RE_LABELS.as_ref()?.captures(query)?;
                let labels = caps[1]
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("and"))
                    .map(str::to_string)
                    .collect();
                Some(SearchFilter { labels, ..SearchFilter::default() })
            }
        }
    }

    fn path_separator(&self, query: &str) -> Option<SearchFilter> {
        if !query.contains('>') {
            return None;
        }
        let mut segments = split_path(query);
        if segments.len() < 2 {
            return None;
        }
        let space = if self.known_spaces.contains(&segments[0].to_lowercase()) {
            Some(segments.remove(0))
        } else {
            None
        };
        Some(SearchFilter { space, path_prefix: segments, labels: vec![] })
    }
}

fn split_path(text: &str) -> Vec<String> {
    text.split('>').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}
