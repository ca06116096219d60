use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::Snafu;

use super::TagFilter;

/// A flat key/value row, as stored by the remote store.
///
/// Rows carry classified tag keys alongside any columns the store adds itself.
pub type Row = BTreeMap<String, String>;

/// A query error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum QueryError {
    /// A regular expression matcher could not be compiled.
    #[snafu(display("invalid pattern '{pattern}' for tag '{key}': {source}"))]
    InvalidPattern {
        /// Key of the tag being matched.
        key: String,

        /// The offending pattern.
        pattern: String,

        /// Error source.
        source: regex::Error,
    },

    /// The backend failed to execute the query.
    #[snafu(display("backend query failed: {reason}"))]
    Backend {
        /// Why the query failed.
        reason: String,
    },
}

/// A single stored value with its series tags.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    /// Timestamp of the value.
    pub time: DateTime<Utc>,

    /// The value.
    pub value: f64,

    /// Tags of the series the value belongs to.
    pub tags: Row,
}

/// Query for the values of matching series within a time range.
///
/// A series matches when it carries every tag in `tags` with the given value. Both bounds of the range are inclusive.
#[derive(Clone, Debug, PartialEq)]
pub struct RangeQuery {
    /// Required tags, by classified key.
    pub tags: Vec<(String, String)>,

    /// Start of the range.
    pub start: DateTime<Utc>,

    /// End of the range.
    pub end: DateTime<Utc>,
}

impl RangeQuery {
    /// Returns `true` if a series with the given tags matches this query.
    pub fn matches_series(&self, row: &Row) -> bool {
        matches_all(&self.tags, row)
    }

    /// Returns `true` if the given time falls within this query's range.
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && time <= self.end
    }
}

/// Predicate selecting the values to delete.
///
/// Values are deleted from every series carrying all of the given tags, within the inclusive time range.
#[derive(Clone, Debug, PartialEq)]
pub struct DeletePredicate {
    /// Required tags, by classified key.
    pub tags: Vec<(String, String)>,

    /// Start of the range, inclusive.
    ///
    /// Backends that cannot represent the full `DateTime<Utc>` range clamp to their own.
    pub start: DateTime<Utc>,

    /// End of the range, inclusive.
    pub stop: DateTime<Utc>,
}

impl DeletePredicate {
    /// Returns `true` if a series with the given tags is selected by this predicate.
    pub fn matches_series(&self, row: &Row) -> bool {
        matches_all(&self.tags, row)
    }
}

fn matches_all(tags: &[(String, String)], row: &Row) -> bool {
    tags.iter()
        .all(|(key, value)| row.get(key).is_some_and(|actual| actual == value))
}

/// What a query backend supports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackendCapabilities {
    /// Whether deletes reliably remove the selected values.
    ///
    /// Some stores only support dropping whole series, or accept delete requests without acting on them.
    pub reliable_delete: bool,
}

/// A query backend.
///
/// Query backends execute read and delete requests against the remote store. They deal in classified tag keys and
/// flat rows: reconstructing metrics and samples from those rows is left to the caller.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Returns the tag rows of every series matching the filter.
    ///
    /// Rows may contain store-specific columns, and the same series may be returned more than once.
    ///
    /// # Errors
    ///
    /// If the query fails, an error is returned.
    async fn find_series(&self, filter: &TagFilter) -> Result<Vec<Row>, QueryError>;

    /// Returns the values of every series matching the query, grouped by series and ordered by time within each.
    ///
    /// # Errors
    ///
    /// If the query fails, an error is returned.
    async fn range(&self, query: &RangeQuery) -> Result<Vec<Vec<Record>>, QueryError>;

    /// Deletes the values selected by the predicate.
    ///
    /// # Errors
    ///
    /// If the delete request fails, an error is returned.
    async fn delete(&self, predicate: &DeletePredicate) -> Result<(), QueryError>;

    /// Returns the capabilities of this backend.
    fn capabilities(&self) -> BackendCapabilities;
}
