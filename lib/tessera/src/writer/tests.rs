use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone as _, Utc};
use http::StatusCode;
use tessera_io::net::TransportStats;
use tokio::sync::Semaphore;
use tokio_test::{assert_pending, assert_ready, task::spawn};

use super::*;
use crate::{
    collector::{CollectorSnapshot, LossReason},
    model::Metric,
};

/// Transport that records requests and answers with a fixed outcome.
///
/// When gated, every request waits until the gate is opened.
struct TestTransport {
    status: StatusCode,
    body: &'static str,
    fail: bool,
    gate: Option<Semaphore>,
    requests: Mutex<Vec<Request<Bytes>>>,
}

impl TestTransport {
    fn ok() -> Self {
        Self::with_status(StatusCode::NO_CONTENT, "")
    }

    fn with_status(status: StatusCode, body: &'static str) -> Self {
        Self {
            status,
            body,
            fail: false,
            gate: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::ok()
        }
    }

    fn gated(self) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..self
        }
    }

    fn open(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, TransportError> {
        self.requests.lock().unwrap().push(request);

        if let Some(gate) = &self.gate {
            let _ = gate.acquire().await;
        }

        if self.fail {
            return Err(TransportError::TimedOut {
                phase: "request",
                timeout: Duration::from_secs(1),
            });
        }

        let mut response = Response::new(Bytes::from_static(self.body.as_bytes()));
        *response.status_mut() = self.status;
        Ok(response)
    }

    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

fn settings(strategy: WriteStrategy, capacity: usize) -> WriterSettings {
    let mut config = StorageConfiguration::new("secret");
    config.bucket = "metrics".to_string();
    config.write_strategy = strategy;
    config.bulkhead_max_concurrent_calls = Some(capacity);
    WriterSettings::from_configuration(&config).unwrap()
}

fn writer(settings: WriterSettings, transport: &Arc<TestTransport>) -> AsyncWriter {
    AsyncWriter::new(settings, Arc::clone(transport) as Arc<dyn Transport>)
}

fn samples(count: usize) -> Vec<Sample> {
    let metric = Metric::builder()
        .intrinsic_tag("name", "cpu")
        .intrinsic_tag("resourceId", "host1")
        .build();
    (0..count)
        .map(|i| Sample::new(metric.clone(), Utc.timestamp_millis_opt(i as i64).unwrap(), i as f64))
        .collect()
}

fn assert_permits_conserved(snapshot: &CollectorSnapshot) {
    assert_eq!(
        snapshot.bulkhead.available_permits + snapshot.bulkhead.in_flight_calls,
        snapshot.bulkhead.max_permits
    );
}

#[tokio::test]
async fn synchronous_write_sends_headers_and_counts_samples() {
    let transport = Arc::new(TestTransport::ok());
    let writer = writer(settings(WriteStrategy::Synchronous, 2), &transport);

    writer.store(&samples(3)).await.unwrap();

    let requests = transport.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method(), Method::POST);
    assert_eq!(
        request.uri().to_string(),
        "http://localhost:8086/api/v2/write?org=default&bucket=metrics&precision=ms"
    );
    let headers = request.headers();
    assert_eq!(headers[CONTENT_TYPE], "text/plain; charset=utf-8");
    assert_eq!(headers[CONTENT_ENCODING], "gzip");
    assert_eq!(headers[ACCEPT], "application/json");
    assert_eq!(headers[AUTHORIZATION], "Token secret");
    assert!(headers[AUTHORIZATION].is_sensitive());
    assert!(headers[USER_AGENT].to_str().unwrap().starts_with("tessera/"));

    let snapshot = writer.collector().snapshot();
    assert_eq!(snapshot.samples_written, 3);
    assert_eq!(snapshot.samples_lost, 0);
    assert_eq!(snapshot.bulkhead.in_flight_calls, 0);
    assert_permits_conserved(&snapshot);
}

#[tokio::test]
async fn synchronous_write_surfaces_http_failure() {
    let transport = Arc::new(TestTransport::with_status(
        StatusCode::BAD_REQUEST,
        "{\"code\":\"invalid\"}",
    ));
    let writer = writer(settings(WriteStrategy::Synchronous, 2), &transport);

    let err = writer.store(&samples(4)).await.unwrap_err();
    match &err {
        StorageError::WriteFailed {
            samples,
            status,
            message,
            body,
        } => {
            assert_eq!(*samples, 4);
            assert_eq!(*status, StatusCode::BAD_REQUEST);
            assert_eq!(message, "Bad Request");
            assert_eq!(body, "{\"code\":\"invalid\"}");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(
        err.to_string(),
        "write of 4 samples failed: 400 - Bad Request: {\"code\":\"invalid\"}"
    );

    let snapshot = writer.collector().snapshot();
    assert_eq!(snapshot.samples_written, 0);
    assert_eq!(snapshot.samples_lost_for(LossReason::HttpFailure), 4);
    assert_permits_conserved(&snapshot);
}

#[tokio::test]
async fn synchronous_write_surfaces_transport_error() {
    let transport = Arc::new(TestTransport::failing());
    let writer = writer(settings(WriteStrategy::Synchronous, 2), &transport);

    let err = writer.store(&samples(2)).await.unwrap_err();
    assert!(matches!(err, StorageError::Transport { samples: 2, .. }));
    assert_eq!(err.lost_samples(), Some(2));

    let snapshot = writer.collector().snapshot();
    assert_eq!(snapshot.samples_lost_for(LossReason::TransportError), 2);
    assert_eq!(snapshot.samples_lost, 2);
    assert_eq!(snapshot.bulkhead.available_permits, 2);
}

#[tokio::test]
async fn encoding_failure_touches_nothing() {
    for strategy in [WriteStrategy::Synchronous, WriteStrategy::Pooled, WriteStrategy::Bulkhead] {
        let transport = Arc::new(TestTransport::ok());
        let writer = writer(settings(strategy, 2), &transport);

        let mut batch = samples(2);
        batch.push(Sample::new(
            Metric::builder().intrinsic_tag("resourceId", "host1").build(),
            Utc.timestamp_millis_opt(5).unwrap(),
            1.0,
        ));

        let err = writer.store(&batch).await.unwrap_err();
        assert!(matches!(err, StorageError::Encoding { .. }));
        writer.close().await;

        assert_eq!(transport.calls(), 0);
        let snapshot = writer.collector().snapshot();
        assert_eq!(snapshot.samples_written, 0);
        assert_eq!(snapshot.samples_lost, 0);
        assert_eq!(snapshot.bulkhead.available_permits, 2);
    }
}

#[tokio::test]
async fn synchronous_admission_rejects_beyond_capacity() {
    let transport = Arc::new(TestTransport::ok().gated());
    let mut settings = settings(WriteStrategy::Synchronous, 2);
    settings.bulkhead_max_wait = Some(Duration::ZERO);
    let writer = writer(settings, &transport);

    let batch = samples(1);
    let mut first = spawn(writer.store(&batch));
    let mut second = spawn(writer.store(&batch));
    assert_pending!(first.poll());
    assert_pending!(second.poll());

    let mut third = spawn(writer.store(&batch));
    let result = assert_ready!(third.poll());
    assert!(matches!(result, Err(StorageError::AdmissionRejected { samples: 1, .. })));
    assert_eq!(transport.calls(), 2);

    let snapshot = writer.collector().snapshot();
    assert_eq!(snapshot.bulkhead.in_flight_calls, 2);
    assert_permits_conserved(&snapshot);

    transport.open();
    assert!(assert_ready!(first.poll()).is_ok());
    assert!(assert_ready!(second.poll()).is_ok());

    let snapshot = writer.collector().snapshot();
    assert_eq!(snapshot.samples_written, 2);
    assert_eq!(snapshot.samples_lost_for(LossReason::AdmissionRejected), 1);
    assert_eq!(snapshot.bulkhead.available_permits, 2);
    assert_permits_conserved(&snapshot);
}

#[tokio::test]
async fn bulkhead_write_returns_on_admission() {
    let transport = Arc::new(TestTransport::ok().gated());
    let mut settings = settings(WriteStrategy::Bulkhead, 1);
    settings.allow_backpressure = false;
    let writer = writer(settings, &transport);

    // The first batch takes the only permit and stays in flight.
    writer.store(&samples(3)).await.unwrap();
    assert_eq!(writer.collector().snapshot().bulkhead.in_flight_calls, 1);

    // Without backpressure, the second batch is dropped rather than waiting. The loss is not returned.
    writer.store(&samples(2)).await.unwrap();

    transport.open();
    writer.close().await;

    let snapshot = writer.collector().snapshot();
    assert_eq!(snapshot.samples_written, 3);
    assert_eq!(snapshot.samples_lost_for(LossReason::AdmissionRejected), 2);
    assert_eq!(snapshot.samples_lost, 2);
    assert_eq!(snapshot.bulkhead.available_permits, 1);
}

#[tokio::test]
async fn bulkhead_write_counts_failures_without_returning_them() {
    let transport = Arc::new(TestTransport::with_status(StatusCode::SERVICE_UNAVAILABLE, "overloaded"));
    let writer = writer(settings(WriteStrategy::Bulkhead, 4), &transport);

    writer.store(&samples(5)).await.unwrap();
    writer.store(&samples(1)).await.unwrap();
    writer.close().await;

    let snapshot = writer.collector().snapshot();
    assert_eq!(transport.calls(), 2);
    assert_eq!(snapshot.samples_written, 0);
    assert_eq!(snapshot.samples_lost_for(LossReason::HttpFailure), 6);
    assert_permits_conserved(&snapshot);
}

#[tokio::test]
async fn bulkhead_write_counts_transport_errors() {
    let transport = Arc::new(TestTransport::failing());
    let writer = writer(settings(WriteStrategy::Bulkhead, 2), &transport);

    writer.store(&samples(3)).await.unwrap();
    writer.store(&samples(4)).await.unwrap();
    writer.close().await;

    let snapshot = writer.collector().snapshot();
    assert_eq!(transport.calls(), 2);
    assert_eq!(snapshot.samples_written, 0);
    assert_eq!(snapshot.samples_lost_for(LossReason::TransportError), 7);
    assert_eq!(snapshot.samples_lost, 7);
    assert_eq!(snapshot.bulkhead.available_permits, 2);
    assert_permits_conserved(&snapshot);
}

#[tokio::test]
async fn pooled_write_counts_transport_errors() {
    let transport = Arc::new(TestTransport::failing());
    let writer = writer(settings(WriteStrategy::Pooled, 2), &transport);

    writer.store(&samples(2)).await.unwrap();
    writer.store(&samples(5)).await.unwrap();
    writer.close().await;

    let snapshot = writer.collector().snapshot();
    assert_eq!(transport.calls(), 2);
    assert_eq!(snapshot.samples_written, 0);
    assert_eq!(snapshot.samples_lost_for(LossReason::TransportError), 7);
    assert_eq!(snapshot.samples_lost, 7);
    assert_permits_conserved(&snapshot);
}

#[tokio::test]
async fn pooled_write_counts_admission_rejections() {
    let transport = Arc::new(TestTransport::ok().gated());
    let mut settings = settings(WriteStrategy::Pooled, 1);
    settings.bulkhead_max_wait = Some(Duration::ZERO);
    let writer = writer(settings, &transport);

    // The first batch holds the only permit while its write is gated, so the I/O task rejects the other two.
    for count in [2, 3, 4] {
        writer.store(&samples(count)).await.unwrap();
    }
    for _ in 0..32 {
        if writer.collector().snapshot().samples_lost_for(LossReason::AdmissionRejected) == 7 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(transport.calls(), 1);

    transport.open();
    writer.close().await;

    let snapshot = writer.collector().snapshot();
    assert_eq!(snapshot.samples_written, 2);
    assert_eq!(snapshot.samples_lost_for(LossReason::AdmissionRejected), 7);
    assert_eq!(snapshot.samples_lost, 7);
    assert_eq!(snapshot.bulkhead.available_permits, 1);
    assert_permits_conserved(&snapshot);
}

#[tokio::test]
async fn pooled_write_drains_on_close() {
    let transport = Arc::new(TestTransport::ok());
    let writer = writer(settings(WriteStrategy::Pooled, 2), &transport);

    for count in [1, 2, 3] {
        writer.store(&samples(count)).await.unwrap();
    }
    writer.close().await;

    assert_eq!(transport.calls(), 3);
    let snapshot = writer.collector().snapshot();
    assert_eq!(snapshot.samples_written, 6);
    assert_eq!(snapshot.samples_lost, 0);
    assert_eq!(snapshot.bulkhead.available_permits, 2);
}

#[tokio::test]
async fn pooled_write_drops_when_queue_full_without_backpressure() {
    let transport = Arc::new(TestTransport::ok().gated());
    let mut settings = settings(WriteStrategy::Pooled, 1);
    settings.allow_backpressure = false;
    settings.pooled_buffer_size = 1;
    let writer = writer(settings, &transport);

    // Nothing yields between these calls, so the I/O task has not taken the first batch off the queue yet.
    writer.store(&samples(2)).await.unwrap();
    writer.store(&samples(3)).await.unwrap();

    transport.open();
    writer.close().await;

    let snapshot = writer.collector().snapshot();
    assert_eq!(transport.calls(), 1);
    assert_eq!(snapshot.samples_written, 2);
    assert_eq!(snapshot.samples_lost_for(LossReason::QueueFull), 3);
}

#[tokio::test]
async fn closed_writer_refuses_writes() {
    let transport = Arc::new(TestTransport::ok());
    let writer = writer(settings(WriteStrategy::Pooled, 2), &transport);

    writer.close().await;
    writer.close().await;

    assert!(matches!(writer.store(&samples(1)).await, Err(StorageError::WriterClosed)));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let transport = Arc::new(TestTransport::ok());
    let writer = writer(settings(WriteStrategy::Synchronous, 2), &transport);

    writer.store(&[]).await.unwrap();
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn synchronous_admission_waits_up_to_max_wait() {
    let transport = Arc::new(TestTransport::ok().gated());
    let mut settings = settings(WriteStrategy::Synchronous, 1);
    settings.bulkhead_max_wait = Some(Duration::from_millis(100));
    let writer = writer(settings, &transport);

    let batch = samples(1);
    let mut first = spawn(writer.store(&batch));
    assert_pending!(first.poll());

    let mut second = spawn(writer.store(&batch));
    assert_pending!(second.poll());
    assert_eq!(writer.collector().snapshot().bulkhead.queued_calls, 1);

    tokio::time::advance(Duration::from_millis(101)).await;
    assert!(second.is_woken());
    let result = assert_ready!(second.poll());
    assert!(matches!(result, Err(StorageError::AdmissionRejected { .. })));
    assert_eq!(writer.collector().snapshot().bulkhead.queued_calls, 0);

    transport.open();
    assert!(assert_ready!(first.poll()).is_ok());
}
