//! Storage facade.
use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::{ensure, ResultExt as _};
use tessera_io::net::Transport;
use tracing::{debug, warn};

use crate::{
    collector::MetricCollector,
    config::{ConfigurationError, StorageConfiguration},
    error::{InvalidArgument, Query, StorageError},
    model::{intrinsic, FetchRequest, Metric, Sample, TagClass, TagMatcher},
    tags,
    writer::{AsyncWriter, WriterSettings},
};

mod filter;
pub use self::filter::{TagClause, TagFilter};

mod memory;
pub use self::memory::{MemoryStore, MEASUREMENT_COLUMN};

mod query;
pub use self::query::{BackendCapabilities, DeletePredicate, QueryBackend, QueryError, RangeQuery, Record, Row};

/// Time series storage.
#[async_trait]
pub trait TimeSeriesStorage: Send + Sync {
    /// Stores a batch of samples.
    ///
    /// # Errors
    ///
    /// If the samples cannot be encoded, or the write fails in a way the write strategy surfaces, an error is returned.
    async fn store(&self, samples: &[Sample]) -> Result<(), StorageError>;

    /// Returns the samples of a metric within a time range, in time order.
    ///
    /// The range is closed: samples at exactly `start` or `end` are both included, so a request spanning the first and
    /// last sample of a series returns all of it. `start > end` returns nothing.
    ///
    /// # Errors
    ///
    /// If the request is invalid or the query fails, an error is returned.
    async fn get_timeseries(&self, request: &FetchRequest) -> Result<Vec<Sample>, StorageError>;

    /// Returns the distinct metrics matching every tag matcher.
    ///
    /// # Errors
    ///
    /// If no matchers are given, a matcher is invalid, or the query fails, an error is returned.
    async fn find_metrics(&self, matchers: &[TagMatcher]) -> Result<Vec<Metric>, StorageError>;

    /// Deletes every stored sample of a metric, on a best-effort basis.
    ///
    /// See [`supports_reliable_delete`][Self::supports_reliable_delete].
    ///
    /// # Errors
    ///
    /// If the metric has no intrinsic `name` tag, or the delete request fails, an error is returned.
    async fn delete(&self, metric: &Metric) -> Result<(), StorageError>;

    /// Returns `true` if deletes reliably remove the selected samples.
    fn supports_reliable_delete(&self) -> bool;
}

/// Storage backed by a remote time series store.
///
/// Writes go through an [`AsyncWriter`], and reads go through a [`QueryBackend`]. Metrics are reconstructed from the
/// rows the backend returns by decoding their classified tag keys; rows without an intrinsic `name` tag were not
/// written through this storage and are skipped.
pub struct Storage {
    writer: AsyncWriter,
    backend: Arc<dyn QueryBackend>,
}

impl Storage {
    /// Creates a new `Storage` from a writer and a query backend.
    pub fn new(writer: AsyncWriter, backend: Arc<dyn QueryBackend>) -> Self {
        Self { writer, backend }
    }

    /// Creates a new `Storage` from a configuration, writing over `transport` and reading through `backend`.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error is returned.
    pub fn from_configuration(
        config: &StorageConfiguration, transport: Arc<dyn Transport>, backend: Arc<dyn QueryBackend>,
    ) -> Result<Self, ConfigurationError> {
        let settings = WriterSettings::from_configuration(config)?;
        Ok(Self::new(AsyncWriter::new(settings, transport), backend))
    }

    /// Returns the writer.
    pub fn writer(&self) -> &AsyncWriter {
        &self.writer
    }

    /// Returns the metric collector of the writer.
    pub fn collector(&self) -> &MetricCollector {
        self.writer.collector()
    }

    /// Closes the writer, waiting for outstanding writes to complete.
    pub async fn close(&self) {
        self.writer.close().await;
    }
}

fn intrinsic_entry(key: &str, value: &str) -> (String, String) {
    (tags::classify(TagClass::Intrinsic, key), value.to_string())
}

#[async_trait]
impl TimeSeriesStorage for Storage {
    async fn store(&self, samples: &[Sample]) -> Result<(), StorageError> {
        self.writer.store(samples).await
    }

    async fn get_timeseries(&self, request: &FetchRequest) -> Result<Vec<Sample>, StorageError> {
        ensure!(
            request.metric.name().is_some(),
            InvalidArgument {
                reason: "metric must have an intrinsic name tag"
            }
        );

        let query = RangeQuery {
            tags: request
                .metric
                .tags(TagClass::Intrinsic)
                .map(|(key, value)| intrinsic_entry(key, value))
                .collect(),
            start: request.start,
            end: request.end,
        };
        let series = self.backend.range(&query).await.context(Query)?;

        let mut samples = Vec::new();
        for records in series {
            // Every record of a series carries the same tags.
            let Some(first) = records.first() else {
                continue;
            };
            let metric = tags::metric_from_entries(&first.tags);
            samples.extend(
                records
                    .into_iter()
                    .map(|record| Sample::new(metric.clone(), record.time, record.value)),
            );
        }
        samples.sort_by_key(Sample::time);

        debug!(metric = %request.metric, samples = samples.len(), "Fetched time series.");
        Ok(samples)
    }

    async fn find_metrics(&self, matchers: &[TagMatcher]) -> Result<Vec<Metric>, StorageError> {
        ensure!(
            !matchers.is_empty(),
            InvalidArgument {
                reason: "at least one tag matcher is required"
            }
        );

        let filter = TagFilter::from_matchers(matchers).context(Query)?;
        debug!(%filter, "Searching for metrics.");
        let rows = self.backend.find_series(&filter).await.context(Query)?;

        let name_key = tags::classify(TagClass::Intrinsic, intrinsic::NAME);
        let mut seen = HashSet::new();
        let mut metrics = Vec::new();
        for row in rows {
            if !row.contains_key(&name_key) {
                continue;
            }

            let metric = tags::metric_from_entries(&row);
            if seen.insert(metric.clone()) {
                metrics.push(metric);
            }
        }

        Ok(metrics)
    }

    async fn delete(&self, metric: &Metric) -> Result<(), StorageError> {
        let Some(name) = metric.name() else {
            return InvalidArgument {
                reason: "metric must have an intrinsic name tag",
            }
            .fail();
        };

        let mut tags = Vec::with_capacity(2);
        if let Some(resource_id) = metric.intrinsic_tag(intrinsic::RESOURCE_ID) {
            tags.push(intrinsic_entry(intrinsic::RESOURCE_ID, resource_id));
        }
        tags.push(intrinsic_entry(intrinsic::NAME, name));

        // Samples may be dated before the epoch or in the future.
        let predicate = DeletePredicate {
            tags,
            start: DateTime::<Utc>::MIN_UTC,
            stop: DateTime::<Utc>::MAX_UTC,
        };

        if !self.supports_reliable_delete() {
            warn!(%metric, "Backend does not reliably support deletes. Samples may remain after deletion.");
        }
        self.backend.delete(&predicate).await.context(Query)
    }

    fn supports_reliable_delete(&self) -> bool {
        self.backend.capabilities().reliable_delete
    }
}
