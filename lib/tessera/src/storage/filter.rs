use std::fmt;

use regex::Regex;
use snafu::ResultExt as _;

use super::{query::InvalidPattern, QueryError, Row};
use crate::{
    model::{MatchType, TagClass, TagMatcher},
    tags,
};

/// Searchable tag classes, in the order their keys appear in a clause.
const SEARCHABLE: [TagClass; 2] = [TagClass::Intrinsic, TagClass::Meta];

#[derive(Clone, Debug)]
enum Comparison {
    Equals(String),
    NotEquals(String),
    Matches(Regex),
    NotMatches(Regex),
}

impl Comparison {
    // Absent tags never satisfy a positive comparison, and always satisfy a negative one.
    fn evaluate(&self, actual: Option<&str>) -> bool {
        match (self, actual) {
            (Self::Equals(expected), Some(actual)) => actual == expected,
            (Self::NotEquals(expected), Some(actual)) => actual != expected,
            (Self::Matches(pattern), Some(actual)) => pattern.is_match(actual),
            (Self::NotMatches(pattern), Some(actual)) => !pattern.is_match(actual),
            (Self::Equals(_) | Self::Matches(_), None) => false,
            (Self::NotEquals(_) | Self::NotMatches(_), None) => true,
        }
    }

    fn is_negated(&self) -> bool {
        matches!(self, Self::NotEquals(_) | Self::NotMatches(_))
    }
}

/// One restriction of a [`TagFilter`]: a comparison applied to the intrinsic and meta tags with the same key.
#[derive(Clone, Debug)]
pub struct TagClause {
    keys: [String; 2],
    comparison: Comparison,
}

impl TagClause {
    fn from_matcher(matcher: &TagMatcher) -> Result<Self, QueryError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).context(InvalidPattern {
                key: matcher.key(),
                pattern,
            })
        };

        let comparison = match matcher.match_type() {
            MatchType::Equals => Comparison::Equals(matcher.value().to_string()),
            MatchType::NotEquals => Comparison::NotEquals(matcher.value().to_string()),
            MatchType::EqualsRegex => Comparison::Matches(compile(matcher.value())?),
            MatchType::NotEqualsRegex => Comparison::NotMatches(compile(matcher.value())?),
        };

        Ok(Self {
            keys: SEARCHABLE.map(|class| tags::classify(class, matcher.key())),
            comparison,
        })
    }

    /// Returns the classified keys this clause compares.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Returns `true` if every key must satisfy the comparison, rather than at least one.
    ///
    /// Negative comparisons must hold for both the intrinsic and the meta tag, while positive comparisons only need one
    /// of them to match.
    pub fn requires_all(&self) -> bool {
        self.comparison.is_negated()
    }

    /// Evaluates this clause against a row.
    pub fn matches(&self, row: &Row) -> bool {
        let mut results = self
            .keys
            .iter()
            .map(|key| self.comparison.evaluate(row.get(key).map(String::as_str)));

        if self.requires_all() {
            results.all(|matched| matched)
        } else {
            results.any(|matched| matched)
        }
    }
}

impl fmt::Display for TagClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (operator, operand) = match &self.comparison {
            Comparison::Equals(value) => ("==", quote(value)),
            Comparison::NotEquals(value) => ("!=", quote(value)),
            Comparison::Matches(pattern) => ("=~", slashed(pattern.as_str())),
            Comparison::NotMatches(pattern) => ("!~", slashed(pattern.as_str())),
        };
        let combinator = if self.requires_all() { " and " } else { " or " };

        f.write_str("(")?;
        for (i, key) in self.keys.iter().enumerate() {
            if i > 0 {
                f.write_str(combinator)?;
            }
            write!(f, "r[{}] {} {}", quote(key), operator, operand)?;
        }
        f.write_str(")")
    }
}

fn quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for c in s.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

fn slashed(pattern: &str) -> String {
    format!("/{}/", pattern.replace('/', "\\/"))
}

/// A restriction on the tags of a series.
///
/// Built from a set of [`TagMatcher`]s, each becoming one [`TagClause`] over the intrinsic and meta tags with the
/// matcher's key. External tags are never searched. A row matches the filter when it matches every clause.
///
/// Filters can be evaluated directly against rows, and render as a Flux-style predicate for remote backends.
#[derive(Clone, Debug)]
pub struct TagFilter {
    clauses: Vec<TagClause>,
}

impl TagFilter {
    /// Builds a filter from tag matchers.
    ///
    /// # Errors
    ///
    /// If a regular expression matcher has an invalid pattern, an error is returned.
    pub fn from_matchers(matchers: &[TagMatcher]) -> Result<Self, QueryError> {
        let clauses = matchers
            .iter()
            .map(TagClause::from_matcher)
            .collect::<Result<_, _>>()?;
        Ok(Self { clauses })
    }

    /// Returns the clauses of this filter.
    pub fn clauses(&self) -> &[TagClause] {
        &self.clauses
    }

    /// Evaluates this filter against a row.
    pub fn matches(&self, row: &Row) -> bool {
        self.clauses.iter().all(|clause| clause.matches(row))
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(" and ")?;
            }
            write!(f, "{}", clause)?;
        }
        Ok(())
    }
}
