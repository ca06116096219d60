use std::io;

use bytes::Bytes;
use http::HeaderValue;
use snafu::ResultExt as _;
use tessera_io::compression::{compress, decompress, CompressionScheme};

use super::{decode_line, encode_sample, DecodeError, Decompress, EncodingError, Point, Utf8};
use crate::model::Sample;

/// A compressed write payload, ready to be sent.
///
/// A batch is owned by exactly one write call and is consumed when that call is sent.
#[derive(Clone, Debug)]
pub struct EncodedBatch {
    payload: Bytes,
    content_encoding: Option<HeaderValue>,
    samples: usize,
    uncompressed_len: usize,
}

impl EncodedBatch {
    /// Returns the compressed payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns the `Content-Encoding` of the payload, if it is compressed.
    pub fn content_encoding(&self) -> Option<&HeaderValue> {
        self.content_encoding.as_ref()
    }

    /// Returns the number of samples in the batch.
    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Returns the size of the payload before compression.
    pub fn uncompressed_len(&self) -> usize {
        self.uncompressed_len
    }

    pub(crate) fn into_payload(self) -> (Bytes, Option<HeaderValue>) {
        (self.payload, self.content_encoding)
    }
}

/// Encodes every sample into a line-protocol record, preserving order.
///
/// # Errors
///
/// If any sample fails to encode, an error is returned and no records are produced.
pub fn encode_samples(samples: &[Sample]) -> Result<Vec<String>, EncodingError> {
    samples.iter().map(encode_sample).collect()
}

/// Joins encoded records with newlines and compresses the result.
///
/// # Errors
///
/// If compression fails, an error is returned.
pub async fn compress_batch(scheme: CompressionScheme, records: &[String]) -> io::Result<EncodedBatch> {
    let joined = records.join("\n");
    let payload = compress(scheme, joined.as_bytes()).await?;

    Ok(EncodedBatch {
        payload: Bytes::from(payload),
        content_encoding: scheme.content_encoding(),
        samples: records.len(),
        uncompressed_len: joined.len(),
    })
}

/// Decompresses a write payload and decodes every record in it.
///
/// Blank lines are skipped.
///
/// # Errors
///
/// If the payload cannot be decompressed, is not UTF-8, or contains a malformed record, an error is returned.
pub async fn decode_payload(content_encoding: Option<&HeaderValue>, payload: &[u8]) -> Result<Vec<Point>, DecodeError> {
    let raw = decompress(content_encoding, payload).await.context(Decompress)?;
    let text = std::str::from_utf8(&raw).context(Utf8)?;

    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(decode_line)
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone as _, Utc};
    use proptest::prelude::*;

    use super::*;
    use crate::model::Metric;

    fn sample(name: &str, resource: &str, millis: i64, value: f64) -> Sample {
        let metric = Metric::builder()
            .intrinsic_tag("name", name)
            .intrinsic_tag("resourceId", resource)
            .build();
        Sample::new(metric, Utc.timestamp_millis_opt(millis).unwrap(), value)
    }

    #[tokio::test]
    async fn records_are_newline_joined_in_order() {
        let samples = vec![
            sample("cpu", "host1", 3, 3.0),
            sample("cpu", "host1", 1, 1.0),
            sample("mem", "host2", 2, 2.0),
        ];
        let records = encode_samples(&samples).unwrap();
        let batch = compress_batch(CompressionScheme::noop(), &records).await.unwrap();

        assert_eq!(batch.samples(), 3);
        assert!(batch.content_encoding().is_none());
        assert_eq!(
            batch.payload().as_ref(),
            b"cpu,intrinsic_name=cpu,intrinsic_resourceId=host1 value=3 3\n\
              cpu,intrinsic_name=cpu,intrinsic_resourceId=host1 value=1 1\n\
              mem,intrinsic_name=mem,intrinsic_resourceId=host2 value=2 2"
        );
        assert_eq!(batch.uncompressed_len(), batch.payload().len());
    }

    #[test]
    fn one_bad_sample_fails_the_whole_batch() {
        let samples = vec![
            sample("cpu", "host1", 1, 1.0),
            Sample::new(Metric::default(), Utc.timestamp_millis_opt(2).unwrap(), 2.0),
        ];
        assert!(encode_samples(&samples).is_err());
    }

    #[tokio::test]
    async fn gzip_batch_decodes() {
        let samples = vec![sample("cpu", "host1", 1, 1.0), sample("cpu", "host1", 2, 2.0)];
        let records = encode_samples(&samples).unwrap();
        let batch = compress_batch(CompressionScheme::gzip_default(), &records).await.unwrap();
        assert_eq!(batch.content_encoding().map(HeaderValue::as_bytes), Some(&b"gzip"[..]));

        let points = decode_payload(batch.content_encoding(), batch.payload()).await.unwrap();
        let decoded: Vec<_> = points.into_iter().map(Point::into_sample).collect();
        assert_eq!(decoded, samples);
    }

    fn arb_sample() -> impl Strategy<Value = Sample> {
        (
            "[a-z][a-z0-9 ,=/]{0,12}",
            proptest::collection::btree_map("[a-zA-Z]{1,6}", "[^\r\n]{1,10}", 0..3),
            proptest::collection::btree_map("[a-zA-Z_ ]{1,6}", "[^\r\n]{1,10}", 0..3),
            0i64..4_102_444_800_000,
            -1.0e12f64..1.0e12,
        )
            .prop_map(|(name, meta, external, millis, value)| {
                let mut builder = Metric::builder().intrinsic_tag("name", name);
                for (k, v) in meta {
                    builder = builder.meta_tag(k, v);
                }
                for (k, v) in external {
                    builder = builder.external_tag(k, v);
                }
                Sample::new(builder.build(), Utc.timestamp_millis_opt(millis).unwrap(), value)
            })
    }

    proptest! {
        #[test]
        fn property_test_batch_integrity(samples in proptest::collection::vec(arb_sample(), 1..20)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let decoded = runtime.block_on(async {
                let records = encode_samples(&samples).unwrap();
                let batch = compress_batch(CompressionScheme::gzip_default(), &records).await.unwrap();
                decode_payload(batch.content_encoding(), batch.payload()).await.unwrap()
            });

            let decoded: Vec<Sample> = decoded.into_iter().map(Point::into_sample).collect();
            prop_assert_eq!(decoded, samples);
        }
    }
}
