use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client, ResponseFuture},
    rt::{TokioExecutor, TokioTimer},
};
use snafu::ResultExt as _;
use tokio::sync::Semaphore;
use tracing::debug;

use super::transport::{Io, ReadBody, SendRequest, TimedOut, Transport, TransportError, TransportStats};

enum Inner {
    Http(Client<HttpConnector, Full<Bytes>>),
    Https(Client<HttpsConnector<HttpConnector>, Full<Bytes>>),
}

impl Inner {
    fn request(&self, req: Request<Full<Bytes>>) -> ResponseFuture {
        match self {
            Self::Http(client) => client.request(req),
            Self::Https(client) => client.request(req),
        }
    }
}

/// An HTTP transport.
///
/// Requests are dispatched over a pooled HTTP/1.1 client. At most `max_connections` requests execute concurrently;
/// further requests wait for a free slot, and are reported as queued in [`TransportStats`] while they do.
///
/// Two independent timeouts apply to every request: the write timeout bounds the time until response headers are
/// received, and the read timeout bounds the time spent reading the response body.
pub struct HttpTransport {
    inner: Inner,
    dispatcher: Arc<Semaphore>,
    max_connections: usize,
    queued: AtomicUsize,
    write_timeout: Duration,
    read_timeout: Duration,
}

impl HttpTransport {
    /// Creates a new builder for configuring an HTTP transport.
    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder::default()
    }

    async fn execute(&self, request: Request<Bytes>) -> Result<Response<Bytes>, TransportError> {
        let response = tokio::time::timeout(self.write_timeout, self.inner.request(request.map(Full::new)))
            .await
            .map_err(|_| {
                TimedOut {
                    phase: "request",
                    timeout: self.write_timeout,
                }
                .build()
            })?
            .context(SendRequest)?;

        let (parts, body) = response.into_parts();
        let body = read_body(body, self.read_timeout).await?;

        Ok(Response::from_parts(parts, body))
    }
}

async fn read_body(body: Incoming, timeout: Duration) -> Result<Bytes, TransportError> {
    let collected = tokio::time::timeout(timeout, body.collect())
        .await
        .map_err(|_| {
            TimedOut {
                phase: "response body read",
                timeout,
            }
            .build()
        })?
        .context(ReadBody)?;

    Ok(collected.to_bytes())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, TransportError> {
        let slot = {
            let _queued = QueuedCall::enter(&self.queued);
            Arc::clone(&self.dispatcher)
                .acquire_owned()
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "transport dispatcher closed"))
                .context(Io)?
        };

        debug!(uri = %request.uri(), body_len = request.body().len(), "Sending request.");
        let result = self.execute(request).await;
        drop(slot);

        result
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            running_calls: self.max_connections - self.dispatcher.available_permits(),
            queued_calls: self.queued.load(Relaxed),
            max_calls: self.max_connections,
        }
    }
}

struct QueuedCall<'a>(&'a AtomicUsize);

impl<'a> QueuedCall<'a> {
    fn enter(queued: &'a AtomicUsize) -> Self {
        queued.fetch_add(1, Relaxed);
        Self(queued)
    }
}

impl Drop for QueuedCall<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Relaxed);
    }
}

/// An HTTP transport builder.
///
/// # Defaults
///
/// - plain HTTP only (see [`with_tls`][Self::with_tls])
/// - 100 concurrent connections, with up to 100 idle connections kept for 5 minutes
/// - 10 second connect timeout
/// - 1 second write timeout and 1 second read timeout
#[derive(Clone, Debug)]
pub struct HttpTransportBuilder {
    tls: bool,
    max_connections: usize,
    connect_timeout: Duration,
    idle_conn_timeout: Duration,
    write_timeout: Duration,
    read_timeout: Duration,
}

impl HttpTransportBuilder {
    /// Enables HTTPS, using the platform's root certificates for server certificate validation.
    ///
    /// Plain HTTP remains available when TLS is enabled.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Sets the maximum number of concurrently executing requests, which is also the size of the idle connection pool.
    ///
    /// Values are clamped to between one and [`Semaphore::MAX_PERMITS`].
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.clamp(1, Semaphore::MAX_PERMITS);
        self
    }

    /// Sets the timeout when connecting to the remote host.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets how long a connection may sit idle in the pool before it is closed.
    pub fn with_idle_conn_timeout(mut self, timeout: Duration) -> Self {
        self.idle_conn_timeout = timeout;
        self
    }

    /// Sets the time allowed between sending a request and receiving the response headers.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the time allowed for reading the response body.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Builds the `HttpTransport`.
    ///
    /// # Errors
    ///
    /// If TLS is enabled and the platform's root certificates could not be loaded, an error is returned.
    pub fn build(self) -> Result<HttpTransport, TransportError> {
        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(!self.tls);
        http_connector.set_connect_timeout(Some(self.connect_timeout));

        let mut hyper_builder = Client::builder(TokioExecutor::new());
        hyper_builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(self.max_connections)
            .pool_idle_timeout(self.idle_conn_timeout);

        let inner = if self.tls {
            let connector = HttpsConnectorBuilder::new()
                .with_native_roots()
                .context(Io)?
                .https_or_http()
                .enable_http1()
                .wrap_connector(http_connector);
            Inner::Https(hyper_builder.build(connector))
        } else {
            Inner::Http(hyper_builder.build(http_connector))
        };

        Ok(HttpTransport {
            inner,
            dispatcher: Arc::new(Semaphore::new(self.max_connections)),
            max_connections: self.max_connections,
            queued: AtomicUsize::new(0),
            write_timeout: self.write_timeout,
            read_timeout: self.read_timeout,
        })
    }
}

impl Default for HttpTransportBuilder {
    fn default() -> Self {
        Self {
            tls: false,
            max_connections: 100,
            connect_timeout: Duration::from_secs(10),
            idle_conn_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
        }
    }
}
