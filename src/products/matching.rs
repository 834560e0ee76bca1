//! Monitor-field parsing and product matching.
//!
//! The monitor field is a free-text target: a product URL, a bare
//! identifier, or a keyword expression. Keyword expressions are
//! comma-separated groups OR'd together; within a group, space-separated
//! tokens are AND'd, matched case-insensitively on whole words, and a
//! leading `-` excludes the token (e.g. `nike dunk -kids, jordan 1`).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::products::CachedProduct;

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^https?://").expect("url pattern is valid"));

/// One OR-branch of a keyword expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordGroup {
    pub require: Vec<String>,
    pub exclude: Vec<String>,
}

impl KeywordGroup {
    fn matches(&self, text: &str) -> bool {
        self.require.iter().all(|t| contains_word(text, t))
            && !self.exclude.iter().any(|t| contains_word(text, t))
    }
}

/// Parsed monitor target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorTarget {
    /// Normalized product URL (query/fragment stripped, no trailing slash).
    Url(String),
    /// Store-scoped product identifier / SKU.
    Identifier(String),
    /// OR'd keyword groups.
    Keywords(Vec<KeywordGroup>),
}

impl MonitorTarget {
    /// Parse a raw monitor field. URLs win, then bare identifiers (a single
    /// token with no comma), then keyword groups.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if URL_RE.is_match(raw) {
            return MonitorTarget::Url(normalize_url(raw));
        }

        if !raw.contains(',') && !raw.contains(char::is_whitespace) {
            return MonitorTarget::Identifier(raw.to_string());
        }

        let groups = raw
            .split(',')
            .filter_map(|group| {
                let mut require = Vec::new();
                let mut exclude = Vec::new();
                for token in group.split_whitespace() {
                    if let Some(stripped) = token.strip_prefix('-') {
                        if !stripped.is_empty() {
                            exclude.push(stripped.to_ascii_lowercase());
                        }
                    } else {
                        require.push(token.to_ascii_lowercase());
                    }
                }
                (!require.is_empty() || !exclude.is_empty())
                    .then_some(KeywordGroup { require, exclude })
            })
            .collect();
        MonitorTarget::Keywords(groups)
    }

    /// Whether a cached snapshot satisfies this target.
    pub fn matches(&self, product: &CachedProduct) -> bool {
        match self {
            MonitorTarget::Url(url) => normalize_url(&product.url) == *url,
            MonitorTarget::Identifier(id) => product.identifier.eq_ignore_ascii_case(id),
            MonitorTarget::Keywords(groups) => {
                groups.iter().any(|group| group.matches(&product.title))
            }
        }
    }

    /// Whether free text (an automation trigger term, a feed title)
    /// satisfies this target. URL and identifier targets match on literal
    /// containment; keyword targets use group logic.
    pub fn matches_text(&self, text: &str) -> bool {
        match self {
            MonitorTarget::Url(url) => text.contains(url.as_str()),
            MonitorTarget::Identifier(id) => contains_word(text, &id.to_ascii_lowercase()),
            MonitorTarget::Keywords(groups) => groups.iter().any(|group| group.matches(text)),
        }
    }
}

fn normalize_url(raw: &str) -> String {
    let base = raw.split(['?', '#']).next().unwrap_or(raw);
    base.trim_end_matches('/').to_ascii_lowercase()
}

/// Case-insensitive whole-word containment. `needle` is already lowercase.
fn contains_word(haystack: &str, needle: &str) -> bool {
    let haystack = haystack.to_ascii_lowercase();
    haystack
        .match_indices(needle)
        .any(|(start, matched)| {
            let before = haystack[..start].chars().next_back();
            let after = haystack[start + matched.len()..].chars().next();
            !before.is_some_and(|c| c.is_alphanumeric())
                && !after.is_some_and(|c| c.is_alphanumeric())
        })
}
