use std::fmt::Write as _;

use chrono::{DateTime, TimeZone as _, Utc};
use snafu::ensure;

use super::{DecodeError, EncodingError, InvalidMeasurement, InvalidTag, MalformedLine, MissingRequiredTag, NonFiniteValue};
use crate::{
    model::{intrinsic, Metric, Sample},
    tags,
};

const VALUE_FIELD: &str = "value";

/// Encodes a sample as a single line-protocol record.
///
/// The record has the form `measurement,tag=value,... value=<value> <timestamp>`, where the measurement is derived from
/// the intrinsic `name` tag, every tag is written under its classified key, and the timestamp is in milliseconds since
/// the Unix epoch.
///
/// # Errors
///
/// If the metric has no intrinsic `name` tag, a tag cannot be represented on the wire, or the value is not finite, an
/// error is returned.
pub fn encode_sample(sample: &Sample) -> Result<String, EncodingError> {
    let metric = sample.metric();
    let Some(name) = metric.name() else {
        return MissingRequiredTag {
            tag: intrinsic::NAME,
            metric: metric.to_string(),
        }
        .fail();
    };

    let value = sample.value();
    ensure!(value.is_finite(), NonFiniteValue { value });

    let measurement = measurement_from_name(name);
    ensure!(!measurement.is_empty(), InvalidMeasurement { name });

    let mut line = String::with_capacity(64);
    line.push_str(&measurement);
    for (class, key, value) in metric.classified_tags() {
        let encoded_key = tags::classify(class, key);
        validate_tag(&encoded_key, key, value)?;

        line.push(',');
        escape_into(&mut line, &encoded_key);
        line.push('=');
        escape_into(&mut line, value);
    }

    // Writing to a `String` is infallible.
    let _ = write!(
        line,
        " {}={} {}",
        VALUE_FIELD,
        value,
        sample.time().timestamp_millis()
    );

    Ok(line)
}

fn measurement_from_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '.' | ':' | '-' => c,
            _ => '_',
        })
        .collect()
}

fn validate_tag(encoded_key: &str, key: &str, value: &str) -> Result<(), EncodingError> {
    ensure!(
        !key.is_empty(),
        InvalidTag {
            key: encoded_key,
            reason: "empty key"
        }
    );
    ensure!(
        !value.is_empty(),
        InvalidTag {
            key: encoded_key,
            reason: "empty value"
        }
    );
    ensure!(
        !has_line_break(key) && !has_line_break(value),
        InvalidTag {
            key: encoded_key,
            reason: "contains a line break"
        }
    );
    Ok(())
}

fn has_line_break(s: &str) -> bool {
    s.contains(['\n', '\r'])
}

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        if matches!(c, ',' | '=' | ' ' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.push(chars.next().unwrap_or('\\'));
        } else {
            out.push(c);
        }
    }
    out
}

// Splits on `delimiter`, skipping over backslash-escaped characters.
fn split_unescaped(s: &str, delimiter: u8) -> Vec<&str> {
    let bytes = s.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
        } else if bytes[i] == delimiter {
            parts.push(&s[start..i]);
            start = i + 1;
            i += 1;
        } else {
            i += 1;
        }
    }
    parts.push(&s[start..]);
    parts
}

/// A decoded line-protocol record.
///
/// Tags are kept exactly as they appear on the wire, under their classified keys.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    /// Measurement of the record.
    pub measurement: String,

    /// Tags of the record, in wire order.
    pub tags: Vec<(String, String)>,

    /// Value of the `value` field.
    pub value: f64,

    /// Timestamp of the record.
    pub time: DateTime<Utc>,
}

impl Point {
    /// Reconstructs the metric of this record from its classified tags.
    pub fn metric(&self) -> Metric {
        tags::metric_from_entries(self.tags.iter().map(|(k, v)| (k, v)))
    }

    /// Converts this record into a sample.
    pub fn into_sample(self) -> Sample {
        Sample::new(self.metric(), self.time, self.value)
    }
}

/// Decodes a single line-protocol record.
///
/// # Errors
///
/// If the line is not a well-formed record with a numeric `value` field and a millisecond timestamp, an error is
/// returned.
pub fn decode_line(line: &str) -> Result<Point, DecodeError> {
    let malformed = |reason: &'static str| MalformedLine { reason, line }.build();

    let parts = split_unescaped(line, b' ');
    let [head, fields, timestamp] = parts.as_slice() else {
        return Err(malformed("expected measurement, fields and timestamp"));
    };

    let mut head_parts = split_unescaped(head, b',').into_iter();
    let measurement = head_parts
        .next()
        .filter(|measurement| !measurement.is_empty())
        .ok_or_else(|| malformed("missing measurement"))?;

    let mut tags = Vec::new();
    for tag in head_parts {
        let pair = split_unescaped(tag, b'=');
        let [key, value] = pair.as_slice() else {
            return Err(malformed("tag is not a key=value pair"));
        };
        tags.push((unescape(key), unescape(value)));
    }

    let value = split_unescaped(fields, b',')
        .into_iter()
        .find_map(|field| field.strip_prefix(VALUE_FIELD)?.strip_prefix('='))
        .ok_or_else(|| malformed("missing field 'value'"))?;
    let value = value
        .strip_suffix('i')
        .unwrap_or(value)
        .parse::<f64>()
        .map_err(|_| malformed("field 'value' is not a number"))?;

    let millis = timestamp
        .parse::<i64>()
        .map_err(|_| malformed("timestamp is not an integer"))?;
    let time = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| malformed("timestamp out of range"))?;

    Ok(Point {
        measurement: unescape(measurement),
        tags,
        value,
        time,
    })
}

/// Decodes a single line-protocol record into a sample.
///
/// # Errors
///
/// If the line is malformed, an error is returned.
pub fn decode_sample(line: &str) -> Result<Sample, DecodeError> {
    decode_line(line).map(Point::into_sample)
}
