//! Lazily compiled request-path matcher.
//!
//! Patterns are user-authored regular expressions (`regex` crate syntax,
//! linear time).  Matching is case-sensitive and unanchored unless the
//! pattern carries its own anchors.
//!
//! The regex is compiled at most once.  Concurrent first matches block on
//! the same [`OnceLock`] and reuse its value, so no request ever observes a
//! half-built matcher.  An invalid pattern is logged once and then matches
//! nothing.

use regex::Regex;
use std::sync::OnceLock;
use tracing::error;

#[derive(Debug, Clone)]
pub struct UrlMatcher {
    pattern: String,
    compiled: OnceLock<Option<Regex>>,
}

impl UrlMatcher {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            compiled: OnceLock::new(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether `path` matches.  `filter_name` only labels the log entry
    /// emitted when compilation fails.
    pub fn matches(&self, filter_name: &str, path: &str) -> bool {
        self.regex(filter_name).is_some_and(|re| re.is_match(path))
    }

    /// Force compilation; `false` if the pattern is invalid.
    pub fn warm(&self, filter_name: &str) -> bool {
        self.regex(filter_name).is_some()
    }

    fn regex(&self, filter_name: &str) -> Option<&Regex> {
        self.compiled
            .get_or_init(|| match Regex::new(&self.pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    error!(
                        filter = %filter_name,
                        pattern = %self.pattern,
                        error = %e,
                        "invalid filter path pattern; filter will never match"
                    );
                    None
                }
            })
            .as_ref()
    }
}
