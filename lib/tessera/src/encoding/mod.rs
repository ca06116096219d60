//! Wire encoding of samples.
use snafu::Snafu;

mod batch;
pub use self::batch::{compress_batch, decode_payload, encode_samples, EncodedBatch};

mod line;
pub use self::line::{decode_line, decode_sample, encode_sample, Point};

/// An error encoding a sample.
///
/// Encoding errors are local: they are raised before any network resources are touched.
#[derive(Debug, Snafu, PartialEq)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum EncodingError {
    /// The metric is missing a tag required for encoding.
    #[snafu(display("metric {metric} is missing required intrinsic tag '{tag}'"))]
    MissingRequiredTag {
        /// Name of the missing tag.
        tag: &'static str,

        /// The offending metric.
        metric: String,
    },

    /// The measurement derived from the metric name is not usable.
    #[snafu(display("metric name '{name}' does not produce a valid measurement"))]
    InvalidMeasurement {
        /// The metric name.
        name: String,
    },

    /// A tag key or value cannot be represented on the wire.
    #[snafu(display("tag '{key}' cannot be encoded: {reason}"))]
    InvalidTag {
        /// Classified key of the tag.
        key: String,

        /// Why the tag was rejected.
        reason: &'static str,
    },

    /// The sample value is NaN or infinite.
    #[snafu(display("sample value {value} is not finite"))]
    NonFiniteValue {
        /// The offending value.
        value: f64,
    },
}

/// An error decoding a write payload.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum DecodeError {
    /// The payload could not be decompressed.
    #[snafu(display("failed to decompress payload: {source}"))]
    Decompress {
        /// Error source.
        source: std::io::Error,
    },

    /// The payload is not valid UTF-8.
    #[snafu(display("payload is not valid UTF-8: {source}"))]
    Utf8 {
        /// Error source.
        source: std::str::Utf8Error,
    },

    /// A line of the payload is malformed.
    #[snafu(display("malformed line ({reason}): {line}"))]
    MalformedLine {
        /// What is wrong with the line.
        reason: &'static str,

        /// The offending line.
        line: String,
    },
}
