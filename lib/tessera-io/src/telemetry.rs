//! Metric registration helpers.
use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram, Label, Level, SharedString};

/// Builder for registering metrics with a consistent set of labels.
///
/// Metrics are registered against whichever recorder is active when the `register_*` method is called, and are
/// registered at info verbosity.
#[derive(Clone, Debug, Default)]
pub struct MetricsBuilder {
    default_labels: Vec<Label>,
}

impl MetricsBuilder {
    /// Adds a label that will be attached to every metric registered through this builder.
    pub fn add_default_label<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<SharedString>,
        V: Into<SharedString>,
    {
        self.default_labels.push(Label::new(key, value));
        self
    }

    /// Registers a counter with the default labels.
    pub fn register_counter(&self, metric_name: &'static str) -> Counter {
        self.register_counter_with_labels(metric_name, std::iter::empty::<(&'static str, &'static str)>())
    }

    /// Registers a counter with the default labels and the given additional labels.
    pub fn register_counter_with_labels<I, K, V>(&self, metric_name: &'static str, additional: I) -> Counter
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<SharedString>,
        V: Into<SharedString>,
    {
        let labels = self.labels_with(additional);
        counter!(level: Level::INFO, metric_name, labels)
    }

    /// Registers a gauge with the default labels.
    pub fn register_gauge(&self, metric_name: &'static str) -> Gauge {
        let labels = self.default_labels.clone();
        gauge!(level: Level::INFO, metric_name, labels)
    }

    /// Registers a histogram with the default labels.
    pub fn register_histogram(&self, metric_name: &'static str) -> Histogram {
        let labels = self.default_labels.clone();
        histogram!(level: Level::INFO, metric_name, labels)
    }

    fn labels_with<I, K, V>(&self, additional: I) -> Vec<Label>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<SharedString>,
        V: Into<SharedString>,
    {
        let mut labels = self.default_labels.clone();
        labels.extend(additional.into_iter().map(|(k, v)| Label::new(k, v)));
        labels
    }
}
