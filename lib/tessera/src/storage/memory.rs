use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{header::CONTENT_ENCODING, Method, Request, Response, StatusCode};
use tessera_io::net::{Transport, TransportError};
use tracing::debug;

use super::{BackendCapabilities, DeletePredicate, QueryBackend, QueryError, RangeQuery, Record, Row, TagFilter};
use crate::encoding::decode_payload;

/// Column holding the measurement of a series.
pub const MEASUREMENT_COLUMN: &str = "_measurement";

const WRITE_PATH: &str = "/api/v2/write";

#[derive(Default)]
struct State {
    series: BTreeMap<Row, BTreeMap<DateTime<Utc>, f64>>,
}

/// An in-memory time series store.
///
/// Acts as both ends of the storage: as a [`Transport`], it accepts write requests and stores the decoded records, and
/// as a [`QueryBackend`], it answers queries over what was stored. Series are keyed by their full set of tags plus the
/// measurement, and writing a value at an existing timestamp replaces it.
pub struct MemoryStore {
    state: Mutex<State>,
    write_requests: AtomicUsize,
    reliable_delete: bool,
}

impl MemoryStore {
    /// Creates a new, empty `MemoryStore`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            write_requests: AtomicUsize::new(0),
            reliable_delete: true,
        }
    }

    /// Sets whether deletes take effect.
    ///
    /// When disabled, delete requests are accepted and ignored, and the store reports that deletes are unreliable.
    pub fn with_reliable_delete(mut self, reliable: bool) -> Self {
        self.reliable_delete = reliable;
        self
    }

    /// Returns the number of requests received through the transport.
    pub fn write_requests(&self) -> usize {
        self.write_requests.load(Relaxed)
    }

    /// Returns the number of stored series.
    pub fn series_count(&self) -> usize {
        self.lock().series.len()
    }

    /// Returns the total number of stored values.
    pub fn value_count(&self) -> usize {
        self.lock().series.values().map(BTreeMap::len).sum()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Bytes> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

#[async_trait]
impl Transport for MemoryStore {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, TransportError> {
        self.write_requests.fetch_add(1, Relaxed);

        if request.method() != Method::POST || !request.uri().path().ends_with(WRITE_PATH) {
            return Ok(respond(StatusCode::NOT_FOUND, "not found"));
        }

        let (parts, body) = request.into_parts();
        let points = match decode_payload(parts.headers.get(CONTENT_ENCODING), &body).await {
            Ok(points) => points,
            Err(e) => return Ok(respond(StatusCode::BAD_REQUEST, e.to_string())),
        };

        let points_len = points.len();
        let mut state = self.lock();
        for point in points {
            let mut row: Row = point.tags.into_iter().collect();
            row.insert(MEASUREMENT_COLUMN.to_string(), point.measurement);
            state.series.entry(row).or_default().insert(point.time, point.value);
        }
        debug!(points = points_len, series = state.series.len(), "Stored write payload.");

        Ok(respond(StatusCode::NO_CONTENT, Bytes::new()))
    }
}

#[async_trait]
impl QueryBackend for MemoryStore {
    async fn find_series(&self, filter: &TagFilter) -> Result<Vec<Row>, QueryError> {
        Ok(self
            .lock()
            .series
            .keys()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect())
    }

    async fn range(&self, query: &RangeQuery) -> Result<Vec<Vec<Record>>, QueryError> {
        if query.start > query.end {
            return Ok(Vec::new());
        }

        let state = self.lock();
        let series = state
            .series
            .iter()
            .filter(|(row, _)| query.matches_series(row))
            .map(|(row, values)| {
                values
                    .range(query.start..=query.end)
                    .map(|(time, value)| Record {
                        time: *time,
                        value: *value,
                        tags: row.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|records| !records.is_empty())
            .collect();

        Ok(series)
    }

    async fn delete(&self, predicate: &DeletePredicate) -> Result<(), QueryError> {
        if !self.reliable_delete || predicate.start > predicate.stop {
            return Ok(());
        }

        let mut state = self.lock();
        for (row, values) in state.series.iter_mut() {
            if predicate.matches_series(row) {
                values.retain(|time, _| *time < predicate.start || *time > predicate.stop);
            }
        }
        state.series.retain(|_, values| !values.is_empty());

        Ok(())
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            reliable_delete: self.reliable_delete,
        }
    }
}
