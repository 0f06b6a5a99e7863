//! Text tokenization shared by segment builds and queries.
//!
//! Text is split on whitespace, ASCII punctuation and any configured extra
//! separators. Tokens outside the configured length bounds are dropped.

use serde::{Deserialize, Serialize};

/// Configuration for the tokenizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    /// Minimum token length (in bytes) to index.
    pub min_token_length: usize,
    /// Maximum token length (in bytes) to index.
    pub max_token_length: usize,
    /// Whether matching is case-insensitive.
    pub case_insensitive: bool,
    /// Additional characters to treat as separators.
    pub extra_separators: Vec<char>,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            min_token_length: 1,
            max_token_length: 256,
            case_insensitive: true,
            extra_separators: vec![],
        }
    }
}

impl TokenizerConfig {
    /// Creates a tokenizer configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets minimum token length.
    #[must_use]
    pub fn min_length(mut self, len: usize) -> Self {
        self.min_token_length = len;
        self
    }

    /// Sets maximum token length.
    #[must_use]
    pub fn max_length(mut self, len: usize) -> Self {
        self.max_token_length = len;
        self
    }

    /// Makes matching case-sensitive.
    #[must_use]
    pub fn case_sensitive(mut self) -> Self {
        self.case_insensitive = false;
        self
    }

    /// Adds extra separator characters.
    #[must_use]
    pub fn with_separators(mut self, chars: &[char]) -> Self {
        self.extra_separators.extend_from_slice(chars);
        self
    }

    fn is_separator(&self, c: char) -> bool {
        c.is_whitespace() || c.is_ascii_punctuation() || self.extra_separators.contains(&c)
    }

    fn accepts(&self, token: &str) -> bool {
        token.len() >= self.min_token_length && token.len() <= self.max_token_length
    }

    /// Normalizes a single token (case folding).
    #[must_use]
    pub fn normalize(&self, token: &str) -> String {
        if self.case_insensitive {
            token.to_lowercase()
        } else {
            token.to_string()
        }
    }

    /// Splits text into normalized tokens, in order, with duplicates.
    #[must_use]
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        text.split(|c| self.is_separator(c))
            .filter(|token| !token.is_empty() && self.accepts(token))
            .map(|token| self.normalize(token))
            .collect()
    }
}
