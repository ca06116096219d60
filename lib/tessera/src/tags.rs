//! Tag classification codec.
//!
//! The remote store has a flat key/value tag model, so the class of each tag is carried in its key: a tag `key` of
//! class `class` is stored under `{class}_{key}`. Decoding strips the class prefix to recover the original classified
//! tag. Keys without a recognized class prefix belong to the store itself and are not part of any metric.
use crate::model::{Metric, MetricBuilder, Tag, TagClass};

const SEPARATOR: char = '_';

/// A tag recovered from its classified key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClassifiedTag {
    /// Class of the tag.
    pub class: TagClass,

    /// The tag itself, with the class prefix removed from its key.
    pub tag: Tag,
}

/// Returns the classified key for a tag key of the given class.
pub fn classify(class: TagClass, key: &str) -> String {
    let mut encoded = String::with_capacity(class.as_str().len() + 1 + key.len());
    encoded.push_str(class.as_str());
    encoded.push(SEPARATOR);
    encoded.push_str(key);
    encoded
}

/// Strips the prefix of `class` from a classified key, returning the original tag key.
///
/// Returns `None` if the key does not belong to the given class.
pub fn strip_class(class: TagClass, encoded_key: &str) -> Option<&str> {
    encoded_key.strip_prefix(class.as_str())?.strip_prefix(SEPARATOR)
}

/// Recovers a classified tag from a classified key and its value.
///
/// Only the first matching class prefix is stripped: `meta_intrinsic_x` decodes to the meta tag `intrinsic_x`. Returns
/// `None` if the key has no recognized class prefix.
pub fn declassify(encoded_key: &str, value: &str) -> Option<ClassifiedTag> {
    TagClass::ALL.into_iter().find_map(|class| {
        strip_class(class, encoded_key).map(|key| ClassifiedTag {
            class,
            tag: Tag::new(key, value),
        })
    })
}

/// Returns every tag of `metric` under its classified key.
pub fn classified_entries(metric: &Metric) -> impl Iterator<Item = (String, &str)> {
    metric
        .classified_tags()
        .map(|(class, key, value)| (classify(class, key), value))
}

/// Reconstructs a metric from flat key/value entries.
///
/// Entries whose key has no recognized class prefix are ignored.
pub fn metric_from_entries<I, K, V>(entries: I) -> Metric
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut builder = MetricBuilder::default();
    for (key, value) in entries {
        if let Some(classified) = declassify(key.as_ref(), value.as_ref()) {
            let ClassifiedTag { class, tag } = classified;
            builder.insert(class, tag.key().to_string(), tag.value().to_string());
        }
    }
    builder.build()
}
