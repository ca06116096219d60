//! Write path telemetry.
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    },
    time::Duration,
};

use metrics::{Counter, Gauge, Histogram};
use tessera_io::{
    bulkhead::{Bulkhead, BulkheadStats},
    net::{Transport, TransportStats},
    telemetry::MetricsBuilder,
};

/// Why a batch of samples was lost.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum LossReason {
    /// No write slot became available within the maximum wait.
    AdmissionRejected,

    /// The request could not be sent, or no complete response was received.
    TransportError,

    /// The remote store answered with a non-success status.
    HttpFailure,

    /// The hand-off queue of the pooled writer was full.
    QueueFull,

    /// The batch could not be compressed.
    CompressionFailure,
}

impl LossReason {
    /// All loss reasons.
    pub const ALL: [LossReason; 5] = [
        LossReason::AdmissionRejected,
        LossReason::TransportError,
        LossReason::HttpFailure,
        LossReason::QueueFull,
        LossReason::CompressionFailure,
    ];

    /// Returns the label value for this reason.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AdmissionRejected => "admission_rejected",
            Self::TransportError => "transport_error",
            Self::HttpFailure => "http_failure",
            Self::QueueFull => "queue_full",
            Self::CompressionFailure => "compression_failure",
        }
    }

    const fn index(&self) -> usize {
        match self {
            Self::AdmissionRejected => 0,
            Self::TransportError => 1,
            Self::HttpFailure => 2,
            Self::QueueFull => 3,
            Self::CompressionFailure => 4,
        }
    }
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the write path.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CollectorSnapshot {
    /// Samples acknowledged by the remote store.
    pub samples_written: u64,

    /// Samples lost, across all reasons.
    pub samples_lost: u64,

    /// Occupancy of the write bulkhead.
    pub bulkhead: BulkheadStats,

    /// Request dispatching of the transport.
    pub transport: TransportStats,

    lost_by_reason: [u64; 5],
}

impl CollectorSnapshot {
    /// Returns the samples lost for the given reason.
    pub fn samples_lost_for(&self, reason: LossReason) -> u64 {
        self.lost_by_reason[reason.index()]
    }
}

struct Telemetry {
    samples_written: Counter,
    samples_lost: [Counter; 5],
    write_latency: Histogram,
    bulkhead_available_permits: Gauge,
    bulkhead_max_permits: Gauge,
    bulkhead_in_flight_calls: Gauge,
    bulkhead_queued_calls: Gauge,
    transport_running_calls: Gauge,
    transport_queued_calls: Gauge,
}

impl Telemetry {
    fn from_builder(builder: &MetricsBuilder) -> Self {
        Self {
            samples_written: builder.register_counter("tessera_samples_written_total"),
            samples_lost: LossReason::ALL.map(|reason| {
                builder.register_counter_with_labels("tessera_samples_lost_total", [("reason", reason.as_str())])
            }),
            write_latency: builder.register_histogram("tessera_write_latency_seconds"),
            bulkhead_available_permits: builder.register_gauge("tessera_bulkhead_available_permits"),
            bulkhead_max_permits: builder.register_gauge("tessera_bulkhead_max_permits"),
            bulkhead_in_flight_calls: builder.register_gauge("tessera_bulkhead_in_flight_calls"),
            bulkhead_queued_calls: builder.register_gauge("tessera_bulkhead_queued_calls"),
            transport_running_calls: builder.register_gauge("tessera_transport_running_calls"),
            transport_queued_calls: builder.register_gauge("tessera_transport_queued_calls"),
        }
    }
}

struct Inner {
    samples_written: AtomicU64,
    samples_lost: [AtomicU64; 5],
    bulkhead: Bulkhead,
    transport: Arc<dyn Transport>,
    telemetry: Telemetry,
}

/// Metric collector for a writer.
///
/// Counts samples written and lost, and observes the occupancy of the writer's bulkhead and transport. Every value is
/// kept locally, readable through [`snapshot`][Self::snapshot], and mirrored to the globally installed `metrics`
/// recorder, if any, labelled with the writer's name.
///
/// Recording never fails.
#[derive(Clone)]
pub struct MetricCollector {
    inner: Arc<Inner>,
}

impl MetricCollector {
    /// Creates a new `MetricCollector` observing the given bulkhead and transport.
    pub fn new(writer_name: &str, bulkhead: Bulkhead, transport: Arc<dyn Transport>) -> Self {
        let builder = MetricsBuilder::default().add_default_label("writer", writer_name.to_string());

        Self {
            inner: Arc::new(Inner {
                samples_written: AtomicU64::new(0),
                samples_lost: Default::default(),
                bulkhead,
                transport,
                telemetry: Telemetry::from_builder(&builder),
            }),
        }
    }

    /// Records a batch acknowledged by the remote store.
    pub fn record_written(&self, samples: usize, latency: Duration) {
        let samples = samples as u64;
        self.inner.samples_written.fetch_add(samples, Relaxed);
        self.inner.telemetry.samples_written.increment(samples);
        self.inner.telemetry.write_latency.record(latency.as_secs_f64());
    }

    /// Records a lost batch.
    pub fn record_lost(&self, reason: LossReason, samples: usize) {
        let samples = samples as u64;
        self.inner.samples_lost[reason.index()].fetch_add(samples, Relaxed);
        self.inner.telemetry.samples_lost[reason.index()].increment(samples);
    }

    /// Publishes the current bulkhead and transport occupancy to the exported gauges.
    pub fn refresh(&self) {
        self.publish(self.inner.bulkhead.stats(), self.inner.transport.stats());
    }

    fn publish(&self, bulkhead: BulkheadStats, transport: TransportStats) {
        let telemetry = &self.inner.telemetry;
        telemetry.bulkhead_available_permits.set(bulkhead.available_permits as f64);
        telemetry.bulkhead_max_permits.set(bulkhead.max_permits as f64);
        telemetry.bulkhead_in_flight_calls.set(bulkhead.in_flight_calls as f64);
        telemetry.bulkhead_queued_calls.set(bulkhead.queued_calls as f64);
        telemetry.transport_running_calls.set(transport.running_calls as f64);
        telemetry.transport_queued_calls.set(transport.queued_calls as f64);
    }

    /// Returns a snapshot of the counters and the current occupancy.
    pub fn snapshot(&self) -> CollectorSnapshot {
        let bulkhead = self.inner.bulkhead.stats();
        let transport = self.inner.transport.stats();
        self.publish(bulkhead, transport);

        let lost_by_reason = LossReason::ALL.map(|reason| self.inner.samples_lost[reason.index()].load(Relaxed));
        CollectorSnapshot {
            samples_written: self.inner.samples_written.load(Relaxed),
            samples_lost: lost_by_reason.iter().sum(),
            bulkhead,
            transport,
            lost_by_reason,
        }
    }
}
