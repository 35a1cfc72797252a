use std::{sync::Arc, time::Duration};

use svcmetrics_common::error::Result;
use svcmetrics_registry::{CounterMetric, DEFAULT_DURATION_BUCKETS, HistogramMetric, MetricRegistry};

/// One finished call, recorded once and dropped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestObservation<'a> {
    pub method: &'a str,
    /// Route template for HTTP, service name for RPC.
    pub route: &'a str,
    /// Status code for HTTP, status-code name for RPC.
    pub outcome: &'a str,
    pub duration: Duration,
}

pub(crate) struct RecorderNames<'a> {
    pub counter: &'a str,
    pub counter_help: &'a str,
    pub histogram: &'a str,
    pub histogram_help: &'a str,
    pub labels: [&'a str; 3],
}

/// A counter and a histogram that always share their label set.
pub(crate) struct RequestRecorder {
    total: Arc<CounterMetric>,
    duration_seconds: Arc<HistogramMetric>,
}

impl RequestRecorder {
    pub(crate) fn register(registry: &MetricRegistry, names: RecorderNames<'_>) -> Result<Self> {
        Ok(Self {
            total: registry.counter_with_labels(names.counter, names.counter_help, &names.labels)?,
            duration_seconds: registry.histogram_with_labels(
                names.histogram,
                names.histogram_help,
                &names.labels,
                &DEFAULT_DURATION_BUCKETS,
            )?,
        })
    }

    pub(crate) fn record(&self, label_values: [&str; 3], duration: Duration) {
        self.total.inc_one(&label_values);
        self.duration_seconds
            .observe_duration(&label_values, duration);
    }
}
