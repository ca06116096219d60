//! Payload compression.
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use async_compression::{
    tokio::{bufread::GzipDecoder, write::GzipEncoder},
    Level,
};
use http::HeaderValue;
use pin_project::pin_project;
use tokio::io::{AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tracing::trace;

static CONTENT_ENCODING_GZIP: HeaderValue = HeaderValue::from_static("gzip");

/// Compression schemes supported by `Compressor`.
#[derive(Copy, Clone, Debug)]
pub enum CompressionScheme {
    /// No compression.
    Noop,
    /// Gzip.
    Gzip(Level),
}

impl CompressionScheme {
    /// No compression.
    pub const fn noop() -> Self {
        Self::Noop
    }

    /// Gzip compression, using the default compression level.
    pub const fn gzip_default() -> Self {
        Self::Gzip(Level::Default)
    }

    /// Returns the content encoding produced by this scheme, if any.
    pub fn content_encoding(&self) -> Option<HeaderValue> {
        match self {
            Self::Noop => None,
            Self::Gzip(_) => Some(CONTENT_ENCODING_GZIP.clone()),
        }
    }
}

/// A writer that counts the bytes passed through to the inner writer.
#[pin_project]
pub struct CountingWriter<W> {
    #[pin]
    inner: W,
    total_written: u64,
}

impl<W> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            total_written: 0,
        }
    }

    fn total_written(&self) -> u64 {
        self.total_written
    }

    fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite> AsyncWrite for CountingWriter<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        let mut this = self.project();
        this.inner.as_mut().poll_write(cx, buf).map(|result| {
            if let Ok(written) = &result {
                *this.total_written += *written as u64;
            }

            result
        })
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Generic compressor.
///
/// Wraps a writer and compresses everything written through it according to the configured `CompressionScheme`. The
/// compressed stream is only complete once the compressor has been shut down.
#[pin_project(project = CompressorProjected)]
pub enum Compressor<W: AsyncWrite> {
    /// No-op compressor.
    Noop(#[pin] CountingWriter<W>),
    /// Gzip compressor.
    Gzip(#[pin] GzipEncoder<CountingWriter<W>>),
}

impl<W: AsyncWrite> Compressor<W> {
    /// Creates a new compressor from a given compression scheme and writer.
    pub fn from_scheme(scheme: CompressionScheme, writer: W) -> Self {
        match scheme {
            CompressionScheme::Noop => Self::Noop(CountingWriter::new(writer)),
            CompressionScheme::Gzip(level) => Self::Gzip(GzipEncoder::with_quality(CountingWriter::new(writer), level)),
        }
    }

    /// Consumes the compressor, returning the inner writer.
    pub fn into_inner(self) -> W {
        match self {
            Self::Noop(encoder) => encoder.into_inner(),
            Self::Gzip(encoder) => encoder.into_inner().into_inner(),
        }
    }

    /// Returns the number of bytes written to the inner writer so far.
    pub fn total_written(&self) -> u64 {
        match self {
            Self::Noop(encoder) => encoder.total_written(),
            Self::Gzip(encoder) => encoder.get_ref().total_written(),
        }
    }
}

impl<W: AsyncWrite> AsyncWrite for Compressor<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        match self.project() {
            CompressorProjected::Noop(encoder) => encoder.poll_write(cx, buf),
            CompressorProjected::Gzip(encoder) => encoder.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.project() {
            CompressorProjected::Noop(encoder) => encoder.poll_flush(cx),
            CompressorProjected::Gzip(encoder) => encoder.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.project() {
            CompressorProjected::Noop(encoder) => encoder.poll_shutdown(cx),
            CompressorProjected::Gzip(encoder) => encoder.poll_shutdown(cx),
        }
    }
}

/// Compresses `input` in full using the given scheme.
///
/// # Errors
///
/// If the compressor fails to write or finalize the stream, an error is returned.
pub async fn compress(scheme: CompressionScheme, input: &[u8]) -> io::Result<Vec<u8>> {
    let mut compressor = Compressor::from_scheme(scheme, Vec::with_capacity(input.len() / 4));
    compressor.write_all(input).await?;
    compressor.shutdown().await?;
    trace!(
        ?scheme,
        uncompressed_len = input.len(),
        compressed_len = compressor.total_written(),
        "Compressed payload."
    );
    Ok(compressor.into_inner())
}

/// Decompresses `input` according to the given `Content-Encoding` value.
///
/// A missing encoding, or `identity`, passes the input through unchanged.
///
/// # Errors
///
/// If the encoding is not supported, or the input is not a valid stream for the encoding, an error is returned.
pub async fn decompress(content_encoding: Option<&HeaderValue>, input: &[u8]) -> io::Result<Vec<u8>> {
    match content_encoding.map(HeaderValue::as_bytes) {
        None | Some(b"identity") => Ok(input.to_vec()),
        Some(b"gzip") => {
            let mut decoder = GzipDecoder::new(input);
            let mut output = Vec::with_capacity(input.len() * 4);
            decoder.read_to_end(&mut output).await?;
            Ok(output)
        }
        Some(other) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported content encoding '{}'", String::from_utf8_lossy(other)),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gzip_roundtrip() {
        let input = b"cpu,intrinsic_name=cpu value=1 1000\ncpu,intrinsic_name=cpu value=2 2000".repeat(32);

        let compressed = compress(CompressionScheme::gzip_default(), &input).await.unwrap();
        assert!(compressed.len() < input.len());
        // Gzip magic bytes.
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);

        let encoding = CompressionScheme::gzip_default().content_encoding();
        let decompressed = decompress(encoding.as_ref(), &compressed).await.unwrap();
        assert_eq!(decompressed, input);
    }

    #[tokio::test]
    async fn noop_passes_through() {
        let input = b"mem value=1 1".to_vec();
        let output = compress(CompressionScheme::noop(), &input).await.unwrap();
        assert_eq!(output, input);
        assert!(CompressionScheme::noop().content_encoding().is_none());
        assert_eq!(decompress(None, &output).await.unwrap(), input);
    }

    #[tokio::test]
    async fn counts_compressed_bytes() {
        let mut compressor = Compressor::from_scheme(CompressionScheme::gzip_default(), Vec::new());
        compressor.write_all(&[b'a'; 4096]).await.unwrap();
        compressor.shutdown().await.unwrap();

        let written = compressor.total_written();
        assert_eq!(written as usize, compressor.into_inner().len());
    }

    #[tokio::test]
    async fn rejects_corrupt_and_unknown_encodings() {
        let gzip = HeaderValue::from_static("gzip");
        assert!(decompress(Some(&gzip), b"not gzip at all").await.is_err());

        let brotli = HeaderValue::from_static("br");
        let err = decompress(Some(&brotli), b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
