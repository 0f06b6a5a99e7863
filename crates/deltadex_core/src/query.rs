//! Search query parsing.
//!
//! A query is a whitespace-separated list of clauses, all of which must
//! match (AND semantics):
//!
//! - `rust` matches documents containing the token in any field
//! - `rus*` matches any token starting with `rus`
//! - `title:rust` restricts the clause to the `title` field
//!
//! Clause text is tokenized with the segment's tokenizer at match time, so
//! `delta-index` is the same as `delta index`.

use crate::error::{CoreError, CoreResult};
use std::fmt;

/// One query clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    /// Field restriction.
    pub field: Option<String>,
    /// Raw clause text, without the field prefix or trailing `*`.
    pub text: String,
    /// Whether the last token is a prefix.
    pub prefix: bool,
}

/// A parsed search query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    clauses: Vec<Clause>,
}

impl Query {
    /// Parses a query string.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidQuery`] for a clause with an empty field
    /// or term (`title:`, `:rust`) or a bare wildcard.
    pub fn parse(input: &str) -> CoreResult<Self> {
        let mut clauses = Vec::new();
        for word in input.split_whitespace() {
            let (field, term) = match word.split_once(':') {
                Some((field, term)) => {
                    if field.is_empty() {
                        return Err(CoreError::invalid_query(format!(
                            "missing field name in {word:?}"
                        )));
                    }
                    (Some(field.to_string()), term)
                }
                None => (None, word),
            };
            let (text, prefix) = match term.strip_suffix('*') {
                Some(stem) => (stem, true),
                None => (term, false),
            };
            if text.is_empty() {
                return Err(CoreError::invalid_query(format!("missing term in {word:?}")));
            }
            clauses.push(Clause {
                field,
                text: text.to_string(),
                prefix,
            });
        }
        Ok(Self { clauses })
    }

    /// Returns the clauses.
    #[must_use]
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Returns true if the query has no clauses.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if let Some(field) = &clause.field {
                write!(f, "{field}:")?;
            }
            f.write_str(&clause.text)?;
            if clause.prefix {
                f.write_str("*")?;
            }
        }
        Ok(())
    }
}
