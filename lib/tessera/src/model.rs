//! Time series data model.
use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};

/// Well-known intrinsic tag names.
pub mod intrinsic {
    /// Name of the metric. Required for a sample to be stored.
    pub const NAME: &str = "name";

    /// Identifier of the resource the metric belongs to.
    pub const RESOURCE_ID: &str = "resourceId";
}

/// Class of a tag.
///
/// Every tag on a metric belongs to exactly one class, which determines how the tag participates in identity and
/// search.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TagClass {
    /// Identity tags. `name` is required.
    Intrinsic,

    /// Auxiliary tags that can be searched.
    Meta,

    /// Tags carried for identification but excluded from search.
    External,
}

impl TagClass {
    /// All tag classes, in decoding precedence order.
    pub const ALL: [TagClass; 3] = [TagClass::Intrinsic, TagClass::Meta, TagClass::External];

    /// Returns the reserved name of this class.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Intrinsic => "intrinsic",
            Self::Meta => "meta",
            Self::External => "external",
        }
    }

    /// Returns `true` if tags of this class can be used in search restrictions.
    pub const fn is_searchable(&self) -> bool {
        !matches!(self, Self::External)
    }
}

impl fmt::Display for TagClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key/value tag.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Tag {
    key: String,
    value: String,
}

impl Tag {
    /// Creates a new `Tag`.
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Returns the key of this tag.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the value of this tag.
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// A metric: the classified set of tags identifying a time series.
///
/// Tag keys are unique within a class, and tags are kept ordered by key. Two metrics are equal when they carry the
/// same tags in the same classes.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Metric {
    intrinsic: BTreeMap<String, String>,
    meta: BTreeMap<String, String>,
    external: BTreeMap<String, String>,
}

impl Metric {
    /// Creates a new builder for a `Metric`.
    pub fn builder() -> MetricBuilder {
        MetricBuilder::default()
    }

    fn class(&self, class: TagClass) -> &BTreeMap<String, String> {
        match class {
            TagClass::Intrinsic => &self.intrinsic,
            TagClass::Meta => &self.meta,
            TagClass::External => &self.external,
        }
    }

    /// Returns the tags of the given class, ordered by key.
    pub fn tags(&self, class: TagClass) -> impl Iterator<Item = (&str, &str)> {
        self.class(class).iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns every tag along with its class: intrinsic tags first, then meta, then external.
    pub fn classified_tags(&self) -> impl Iterator<Item = (TagClass, &str, &str)> {
        TagClass::ALL
            .into_iter()
            .flat_map(move |class| self.tags(class).map(move |(k, v)| (class, k, v)))
    }

    /// Returns the value of the tag with the given key in the given class.
    pub fn tag(&self, class: TagClass, key: &str) -> Option<&str> {
        self.class(class).get(key).map(String::as_str)
    }

    /// Returns the value of the intrinsic tag with the given key.
    pub fn intrinsic_tag(&self, key: &str) -> Option<&str> {
        self.tag(TagClass::Intrinsic, key)
    }

    /// Returns the value of the first tag with the given key, searching intrinsic, meta, and then external tags.
    pub fn first_tag_by_key(&self, key: &str) -> Option<&str> {
        TagClass::ALL.into_iter().find_map(|class| self.tag(class, key))
    }

    /// Returns the value of the intrinsic `name` tag.
    pub fn name(&self) -> Option<&str> {
        self.intrinsic_tag(intrinsic::NAME)
    }

    /// Returns the total number of tags across all classes.
    pub fn len(&self) -> usize {
        self.intrinsic.len() + self.meta.len() + self.external.len()
    }

    /// Returns `true` if this metric carries no tags at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (class, key, value)) in self.classified_tags().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}_{}={}", class, key, value)?;
        }
        f.write_str("}")
    }
}

/// Builder for [`Metric`].
///
/// Adding a tag whose key already exists within the same class replaces the previous value.
#[derive(Clone, Debug, Default)]
pub struct MetricBuilder {
    metric: Metric,
}

impl MetricBuilder {
    /// Adds a tag of the given class.
    pub fn tag<K, V>(mut self, class: TagClass, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.insert(class, key.into(), value.into());
        self
    }

    /// Adds an intrinsic tag.
    pub fn intrinsic_tag<K, V>(self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tag(TagClass::Intrinsic, key, value)
    }

    /// Adds a meta tag.
    pub fn meta_tag<K, V>(self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tag(TagClass::Meta, key, value)
    }

    /// Adds an external tag.
    pub fn external_tag<K, V>(self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tag(TagClass::External, key, value)
    }

    pub(crate) fn insert(&mut self, class: TagClass, key: String, value: String) {
        let tags = match class {
            TagClass::Intrinsic => &mut self.metric.intrinsic,
            TagClass::Meta => &mut self.metric.meta,
            TagClass::External => &mut self.metric.external,
        };
        tags.insert(key, value);
    }

    /// Builds the `Metric`.
    pub fn build(self) -> Metric {
        self.metric
    }
}

/// A single timestamped measurement of a metric.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    metric: Metric,
    time: DateTime<Utc>,
    value: f64,
}

impl Sample {
    /// Creates a new `Sample`.
    pub fn new(metric: Metric, time: DateTime<Utc>, value: f64) -> Self {
        Self { metric, time, value }
    }

    /// Returns the metric this sample belongs to.
    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    /// Returns the time of this sample.
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Returns the value of this sample.
    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Request for the samples of one metric within a time range.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchRequest {
    /// Metric to fetch samples for.
    pub metric: Metric,

    /// Start of the range.
    pub start: DateTime<Utc>,

    /// End of the range.
    pub end: DateTime<Utc>,
}

impl FetchRequest {
    /// Creates a new `FetchRequest`.
    pub fn new(metric: Metric, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { metric, start, end }
    }
}

/// Comparison performed by a [`TagMatcher`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MatchType {
    /// Tag value equals the matcher value.
    Equals,

    /// Tag value does not equal the matcher value.
    NotEquals,

    /// Tag value matches the matcher's regular expression.
    EqualsRegex,

    /// Tag value does not match the matcher's regular expression.
    NotEqualsRegex,
}

impl MatchType {
    /// Returns `true` if this is a negative comparison.
    pub const fn is_negated(&self) -> bool {
        matches!(self, Self::NotEquals | Self::NotEqualsRegex)
    }
}

/// A restriction on the value of a tag, used when searching for metrics.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TagMatcher {
    match_type: MatchType,
    key: String,
    value: String,
}

impl TagMatcher {
    /// Creates a new `TagMatcher`.
    pub fn new<K, V>(match_type: MatchType, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_type,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Matches tags whose value equals `value`.
    pub fn equals<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self::new(MatchType::Equals, key, value)
    }

    /// Matches tags whose value differs from `value`.
    pub fn not_equals<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self::new(MatchType::NotEquals, key, value)
    }

    /// Matches tags whose value matches the regular expression `pattern`.
    pub fn equals_regex<K: Into<String>, V: Into<String>>(key: K, pattern: V) -> Self {
        Self::new(MatchType::EqualsRegex, key, pattern)
    }

    /// Matches tags whose value does not match the regular expression `pattern`.
    pub fn not_equals_regex<K: Into<String>, V: Into<String>>(key: K, pattern: V) -> Self {
        Self::new(MatchType::NotEqualsRegex, key, pattern)
    }

    /// Returns the comparison performed by this matcher.
    pub fn match_type(&self) -> MatchType {
        self.match_type
    }

    /// Returns the tag key this matcher applies to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the value, or pattern, this matcher compares against.
    pub fn value(&self) -> &str {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_tag_replaces_earlier_within_class() {
        let metric = Metric::builder()
            .intrinsic_tag("name", "cpu")
            .intrinsic_tag("name", "mem")
            .meta_tag("name", "cpu")
            .build();

        assert_eq!(metric.name(), Some("mem"));
        assert_eq!(metric.tag(TagClass::Meta, "name"), Some("cpu"));
        assert_eq!(metric.len(), 2);
    }

    #[test]
    fn equality_ignores_insertion_order() {
        let a = Metric::builder()
            .intrinsic_tag("name", "cpu")
            .intrinsic_tag("resourceId", "host1")
            .external_tag("type", "gauge")
            .build();
        let b = Metric::builder()
            .external_tag("type", "gauge")
            .intrinsic_tag("resourceId", "host1")
            .intrinsic_tag("name", "cpu")
            .build();

        assert_eq!(a, b);
    }

    #[test]
    fn same_key_in_different_classes_is_distinct() {
        let intrinsic = Metric::builder().intrinsic_tag("host", "a").build();
        let meta = Metric::builder().meta_tag("host", "a").build();
        assert_ne!(intrinsic, meta);
    }

    #[test]
    fn first_tag_by_key_prefers_intrinsic() {
        let metric = Metric::builder()
            .external_tag("unit", "bytes")
            .meta_tag("unit", "kilobytes")
            .build();
        assert_eq!(metric.first_tag_by_key("unit"), Some("kilobytes"));
        assert_eq!(metric.first_tag_by_key("missing"), None);
    }

    #[test]
    fn classified_tags_are_grouped_by_class() {
        let metric = Metric::builder()
            .external_tag("e", "3")
            .meta_tag("m", "2")
            .intrinsic_tag("name", "1")
            .build();

        let classes: Vec<_> = metric.classified_tags().map(|(class, _, _)| class).collect();
        assert_eq!(classes, vec![TagClass::Intrinsic, TagClass::Meta, TagClass::External]);
        assert_eq!(metric.to_string(), "{intrinsic_name=1, meta_m=2, external_e=3}");
    }
}
