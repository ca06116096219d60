//! Time series storage client.
//!
//! Samples are encoded as line-protocol records, with every tag written under a key carrying its class, then
//! compressed and written to the remote store through an [`AsyncWriter`](writer::AsyncWriter). Writes are bounded by a
//! bulkhead: a write that cannot be admitted in time is dropped and counted, never queued without bound. Reads go
//! through a [`QueryBackend`](storage::QueryBackend), and metrics are rebuilt from the classified tag keys.
#![deny(missing_docs)]

pub mod collector;
pub mod config;
pub mod encoding;
pub mod error;
pub mod model;
pub mod storage;
pub mod tags;
pub mod writer;

pub use self::collector::{CollectorSnapshot, LossReason, MetricCollector};
pub use self::config::{ConfigurationError, StorageConfiguration};
pub use self::error::StorageError;
pub use self::model::{FetchRequest, MatchType, Metric, Sample, Tag, TagClass, TagMatcher};
pub use self::storage::{Storage, TimeSeriesStorage};
pub use self::writer::{AsyncWriter, WriteStrategy, WriterSettings};
