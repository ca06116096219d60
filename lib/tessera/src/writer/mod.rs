//! Sample writer.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt as _};
use http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT},
    HeaderValue, Method, Request, Response, Uri,
};
use serde::Deserialize;
use snafu::ResultExt as _;
use tessera_io::{
    bulkhead::{Bulkhead, BulkheadPermit},
    compression::CompressionScheme,
    net::{Transport, TransportError},
};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};
use url::Url;

use crate::{
    collector::{LossReason, MetricCollector},
    config::{ConfigurationError, InvalidField, StorageConfiguration},
    encoding::{compress_batch, encode_samples, EncodedBatch},
    error::{Encoding, StorageError},
    model::Sample,
};

mod pooled;

static CONTENT_TYPE_LINE_PROTOCOL: HeaderValue = HeaderValue::from_static("text/plain; charset=utf-8");
static ACCEPT_JSON: HeaderValue = HeaderValue::from_static("application/json");
static USER_AGENT_VALUE: HeaderValue = HeaderValue::from_static(concat!("tessera/", env!("CARGO_PKG_VERSION")));

/// How the writer dispatches batches to the remote store.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    /// Writes are sent on the caller's task, and `store` returns once the remote store has answered.
    ///
    /// Every failure is returned to the caller.
    Synchronous,

    /// Writes are handed to a bounded queue drained by a background task, and `store` returns once the batch is queued.
    Pooled,

    /// Writes are admitted through the bulkhead on the caller's task and then sent in the background, and `store`
    /// returns once the batch is admitted.
    #[default]
    Bulkhead,
}

/// Target of write requests.
#[derive(Clone, Debug)]
pub struct WriteEndpoint {
    uri: Uri,
    authorization: HeaderValue,
}

impl WriteEndpoint {
    /// Creates a new `WriteEndpoint` for the given write URL, authenticating with `token`.
    ///
    /// # Errors
    ///
    /// If the URL is not a valid request URI, or the token cannot be used in a header, an error is returned.
    pub fn new(url: &Url, token: &str) -> Result<Self, ConfigurationError> {
        let uri = url.as_str().parse::<Uri>().map_err(|e| {
            InvalidField {
                field: "url",
                reason: e.to_string(),
            }
            .build()
        })?;

        let mut authorization = HeaderValue::from_str(&format!("Token {}", token)).map_err(|_| {
            InvalidField {
                field: "token",
                reason: "contains characters not allowed in a header",
            }
            .build()
        })?;
        authorization.set_sensitive(true);

        Ok(Self { uri, authorization })
    }

    /// Returns the request URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    fn build_request(&self, batch: EncodedBatch) -> Result<Request<Bytes>, http::Error> {
        let (payload, content_encoding) = batch.into_payload();

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone())
            .header(CONTENT_TYPE, CONTENT_TYPE_LINE_PROTOCOL.clone())
            .header(ACCEPT, ACCEPT_JSON.clone())
            .header(USER_AGENT, USER_AGENT_VALUE.clone())
            .header(AUTHORIZATION, self.authorization.clone());
        if let Some(content_encoding) = content_encoding {
            builder = builder.header(CONTENT_ENCODING, content_encoding);
        }

        builder.body(payload)
    }
}

/// Writer settings.
#[derive(Clone, Debug)]
pub struct WriterSettings {
    /// Name of the writer, used to label its telemetry.
    pub name: String,

    /// How batches are dispatched.
    pub strategy: WriteStrategy,

    /// Whether callers wait when the writer is saturated.
    pub allow_backpressure: bool,

    /// Number of concurrent writes allowed.
    pub bulkhead_capacity: usize,

    /// Maximum time a write waits for admission, or `None` to wait indefinitely.
    pub bulkhead_max_wait: Option<Duration>,

    /// Number of batches the pooled strategy queues.
    pub pooled_buffer_size: usize,

    /// Compression applied to payloads.
    pub compression: CompressionScheme,

    /// Target of write requests.
    pub endpoint: WriteEndpoint,
}

impl WriterSettings {
    /// Derives writer settings from a storage configuration.
    ///
    /// The writer is named after the configured bucket.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error is returned.
    pub fn from_configuration(config: &StorageConfiguration) -> Result<Self, ConfigurationError> {
        config.validate()?;

        Ok(Self {
            name: config.bucket.clone(),
            strategy: config.write_strategy,
            allow_backpressure: config.allow_backpressure,
            bulkhead_capacity: config.bulkhead_capacity(),
            bulkhead_max_wait: config.bulkhead_max_wait(),
            pooled_buffer_size: config.pooled_buffer_size,
            compression: config.compression_scheme(),
            endpoint: WriteEndpoint::new(&config.write_url()?, &config.token)?,
        })
    }
}

/// State shared by every write in flight.
struct Shared {
    name: String,
    transport: Arc<dyn Transport>,
    bulkhead: Bulkhead,
    collector: MetricCollector,
    endpoint: WriteEndpoint,
}

impl Shared {
    async fn admit(&self, samples: usize, max_wait: Option<Duration>) -> Result<BulkheadPermit, StorageError> {
        match self.bulkhead.acquire_within(max_wait).await {
            Ok(permit) => Ok(permit),
            Err(e) => {
                warn!(writer = self.name, samples, max_wait = ?e.max_wait, "Write rejected: no write slot available. Dropping batch.");
                self.collector.record_lost(LossReason::AdmissionRejected, samples);
                Err(StorageError::AdmissionRejected { samples, source: e })
            }
        }
    }

    // The permit is released only once the outcome has been recorded.
    async fn transmit(&self, batch: EncodedBatch, permit: BulkheadPermit) -> Result<(), StorageError> {
        let samples = batch.samples();
        let started = Instant::now();

        let outcome = match self.endpoint.build_request(batch) {
            Ok(request) => {
                self.collector.refresh();
                let result = self.transport.send(request).await;
                self.settle(samples, started, result)
            }
            Err(e) => {
                error!(writer = self.name, samples, error = %e, "Failed to build write request. Dropping batch.");
                self.collector.record_lost(LossReason::TransportError, samples);
                Err(StorageError::Request { source: e })
            }
        };

        permit.release();
        self.collector.refresh();

        outcome
    }

    fn settle(
        &self, samples: usize, started: Instant, result: Result<Response<Bytes>, TransportError>,
    ) -> Result<(), StorageError> {
        match result {
            Ok(response) if response.status().is_success() => {
                let latency = started.elapsed();
                debug!(writer = self.name, samples, status = %response.status(), ?latency, "Write completed.");
                self.collector.record_written(samples, latency);
                Ok(())
            }
            Ok(response) => {
                let status = response.status();
                let message = status.canonical_reason().unwrap_or("Unknown Status").to_string();
                let body = String::from_utf8_lossy(response.body()).into_owned();
                error!(
                    writer = self.name,
                    samples,
                    "Write failed: {} - {}: {}",
                    status.as_u16(),
                    message,
                    body
                );
                self.collector.record_lost(LossReason::HttpFailure, samples);
                Err(StorageError::WriteFailed {
                    samples,
                    status,
                    message,
                    body,
                })
            }
            Err(e) => {
                error!(writer = self.name, samples, error = %e, "Failed to send write request. Dropping batch.");
                self.collector.record_lost(LossReason::TransportError, samples);
                Err(StorageError::Transport { samples, source: e })
            }
        }
    }
}

type Dispatch = Box<dyn Fn(EncodedBatch) -> BoxFuture<'static, Result<(), StorageError>> + Send + Sync>;

/// A sample writer.
///
/// Encodes and compresses each batch of samples on the caller's task, then hands it to the dispatch path selected by
/// the [`WriteStrategy`]. Every strategy shares the same admission and outcome handling:
///
/// - at most `bulkhead_capacity` writes are in flight at once, and a write that cannot be admitted within the maximum
///   wait is dropped
/// - a write holds its bulkhead permit until its outcome has been recorded
/// - lost batches are never retried
///
/// Outcomes are always recorded in the writer's [`MetricCollector`] and logged. Only the synchronous strategy also
/// returns them to the caller: the asynchronous strategies return once the batch has been handed off.
///
/// The pooled and bulkhead strategies spawn tasks, so a writer must be created and used within a Tokio runtime.
pub struct AsyncWriter {
    shared: Arc<Shared>,
    strategy: WriteStrategy,
    compression: CompressionScheme,
    dispatch: Dispatch,
    queue: Option<Arc<pooled::Queue>>,
    tasks: TaskTracker,
    closed: AtomicBool,
}

impl AsyncWriter {
    /// Creates a new `AsyncWriter` sending over the given transport.
    pub fn new(settings: WriterSettings, transport: Arc<dyn Transport>) -> Self {
        let WriterSettings {
            name,
            strategy,
            allow_backpressure,
            bulkhead_capacity,
            bulkhead_max_wait,
            pooled_buffer_size,
            compression,
            endpoint,
        } = settings;

        let bulkhead = Bulkhead::new(format!("{}-writes", name), bulkhead_capacity.max(1), bulkhead_max_wait);
        let collector = MetricCollector::new(&name, bulkhead.clone(), Arc::clone(&transport));
        let shared = Arc::new(Shared {
            name,
            transport,
            bulkhead,
            collector,
            endpoint,
        });

        let tasks = TaskTracker::new();
        let mut queue = None;

        let dispatch: Dispatch = match strategy {
            WriteStrategy::Synchronous => {
                let shared = Arc::clone(&shared);
                Box::new(move |batch| {
                    let shared = Arc::clone(&shared);
                    async move {
                        let permit = shared.admit(batch.samples(), bulkhead_max_wait).await?;
                        shared.transmit(batch, permit).await
                    }
                    .boxed()
                })
            }
            WriteStrategy::Bulkhead => {
                let shared = Arc::clone(&shared);
                let tasks = tasks.clone();
                let max_wait = if allow_backpressure {
                    bulkhead_max_wait
                } else {
                    Some(Duration::ZERO)
                };
                Box::new(move |batch| {
                    let shared = Arc::clone(&shared);
                    let tasks = tasks.clone();
                    async move {
                        // Rejections are recorded on admission.
                        if let Ok(permit) = shared.admit(batch.samples(), max_wait).await {
                            tasks.spawn(async move {
                                // The outcome is already counted and logged when the write settles.
                                let _ = shared.transmit(batch, permit).await;
                            });
                        }
                        Ok(())
                    }
                    .boxed()
                })
            }
            WriteStrategy::Pooled => {
                let (pool_queue, batches) = pooled::Queue::new(pooled_buffer_size);
                let pool_queue = Arc::new(pool_queue);
                tasks.spawn(pooled::run_io_loop(batches, Arc::clone(&shared), bulkhead_max_wait));
                queue = Some(Arc::clone(&pool_queue));

                let shared = Arc::clone(&shared);
                Box::new(move |batch| {
                    let shared = Arc::clone(&shared);
                    let pool_queue = Arc::clone(&pool_queue);
                    async move { pooled::enqueue(&pool_queue, &shared, batch, allow_backpressure).await }.boxed()
                })
            }
        };

        debug!(writer = shared.name, ?strategy, bulkhead_capacity, ?bulkhead_max_wait, "Created writer.");

        Self {
            shared,
            strategy,
            compression,
            dispatch,
            queue,
            tasks,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the name of this writer.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns the dispatch strategy of this writer.
    pub fn strategy(&self) -> WriteStrategy {
        self.strategy
    }

    /// Returns the metric collector of this writer.
    pub fn collector(&self) -> &MetricCollector {
        &self.shared.collector
    }

    /// Writes a batch of samples.
    ///
    /// Sample order is preserved within the batch. An empty batch is a no-op.
    ///
    /// # Errors
    ///
    /// If the writer is closed, or a sample cannot be encoded, an error is returned and nothing is sent. If the batch
    /// cannot be compressed, it is counted as lost and an error is returned. With the synchronous strategy, admission
    /// and write failures are returned as well.
    pub async fn store(&self, samples: &[Sample]) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::WriterClosed);
        }
        if samples.is_empty() {
            return Ok(());
        }

        let records = encode_samples(samples).context(Encoding)?;
        let batch = match compress_batch(self.compression, &records).await {
            Ok(batch) => batch,
            Err(e) => {
                let samples = samples.len();
                error!(writer = self.shared.name, samples, error = %e, "Failed to compress batch. Dropping batch.");
                self.shared.collector.record_lost(LossReason::CompressionFailure, samples);
                return Err(StorageError::Compression { samples, source: e });
            }
        };
        trace!(
            writer = self.shared.name,
            samples = batch.samples(),
            uncompressed_len = batch.uncompressed_len(),
            compressed_len = batch.payload().len(),
            "Encoded batch."
        );

        (self.dispatch)(batch).await
    }

    /// Closes the writer.
    ///
    /// New writes are refused, and this waits for every write already handed off to complete. Closing an already
    /// closed writer only waits for outstanding writes.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(writer = self.shared.name, "Closing writer.");
        }

        if let Some(queue) = &self.queue {
            queue.close();
        }
        self.tasks.close();
        self.tasks.wait().await;
    }
}

#[cfg(test)]
mod tests;
