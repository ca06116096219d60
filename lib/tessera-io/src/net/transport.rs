use std::{io, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use snafu::Snafu;

/// A transport error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub))]
pub enum TransportError {
    /// The request could not be sent, or no response was received.
    #[snafu(display("failed to send request: {source}"))]
    SendRequest {
        /// Error source.
        source: hyper_util::client::legacy::Error,
    },

    /// The response body could not be read.
    #[snafu(display("failed to read response body: {source}"))]
    ReadBody {
        /// Error source.
        source: hyper::Error,
    },

    /// The request did not complete within the configured timeout.
    #[snafu(display("{phase} timed out after {timeout:?}"))]
    TimedOut {
        /// Which phase of the request timed out.
        phase: &'static str,

        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// A lower-level I/O error.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// Error source.
        source: io::Error,
    },
}

/// Point-in-time view of a transport's request dispatching.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TransportStats {
    /// Requests currently being executed.
    pub running_calls: usize,

    /// Requests waiting for a free connection slot.
    pub queued_calls: usize,

    /// Maximum number of concurrently executing requests.
    pub max_calls: usize,
}

/// A network transport.
///
/// Transports carry a fully-formed request to the remote store and hand back the response, with its body fully read.
/// A non-success status is not an error at this level: interpreting the status is up to the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request and waits for the complete response.
    ///
    /// # Errors
    ///
    /// If the request could not be sent, timed out, or the response body could not be read, an error is returned.
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, TransportError>;

    /// Returns the current dispatching statistics of this transport.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}
