//! Caller-facing storage errors.
use http::StatusCode;
use snafu::Snafu;
use tessera_io::{bulkhead, net::TransportError};

use crate::{encoding::EncodingError, storage::QueryError};

/// A storage error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum StorageError {
    /// A sample could not be encoded. Nothing was sent.
    #[snafu(display("failed to encode samples: {source}"))]
    Encoding {
        /// Error source.
        source: EncodingError,
    },

    /// The encoded batch could not be compressed. Nothing was sent.
    #[snafu(display("failed to compress batch of {samples} samples: {source}"))]
    Compression {
        /// Number of samples in the batch.
        samples: usize,

        /// Error source.
        source: std::io::Error,
    },

    /// No write slot became available in time.
    #[snafu(display("write of {samples} samples rejected: {source}"))]
    AdmissionRejected {
        /// Number of samples in the batch.
        samples: usize,

        /// Error source.
        source: bulkhead::AdmissionRejected,
    },

    /// The write request could not be completed.
    #[snafu(display("write of {samples} samples failed: {source}"))]
    Transport {
        /// Number of samples in the batch.
        samples: usize,

        /// Error source.
        source: TransportError,
    },

    /// The remote store answered the write with a non-success status.
    #[snafu(display("write of {samples} samples failed: {} - {message}: {body}", status.as_u16()))]
    WriteFailed {
        /// Number of samples in the batch.
        samples: usize,

        /// Response status.
        status: StatusCode,

        /// Status reason.
        message: String,

        /// Response body.
        body: String,
    },

    /// The write request could not be built.
    #[snafu(display("failed to build write request: {source}"))]
    Request {
        /// Error source.
        source: http::Error,
    },

    /// A read query failed.
    #[snafu(display("query failed: {source}"))]
    Query {
        /// Error source.
        source: QueryError,
    },

    /// An argument was rejected.
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument {
        /// Why the argument was rejected.
        reason: String,
    },

    /// The writer has been closed.
    #[snafu(display("writer is closed"))]
    WriterClosed,
}

impl StorageError {
    /// Returns the number of samples lost to this error, if it is a write failure.
    pub fn lost_samples(&self) -> Option<usize> {
        match self {
            Self::Compression { samples, .. }
            | Self::AdmissionRejected { samples, .. }
            | Self::Transport { samples, .. }
            | Self::WriteFailed { samples, .. } => Some(*samples),
            _ => None,
        }
    }
}
