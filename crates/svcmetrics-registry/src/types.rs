use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    /// Name used on the `# TYPE` line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of a registered metric. Fixed at registration.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDescriptor {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub variable_labels: Vec<String>,
    /// Upper bounds, ascending, without `+Inf`. Empty unless `kind` is `Histogram`.
    pub buckets: Vec<f64>,
}

/// Point-in-time value of one series.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Counter(f64),
    Gauge(f64),
    Histogram {
        /// Per-bucket (non-cumulative) counts; the last entry is the `+Inf` bucket.
        buckets: Vec<(f64, u64)>,
        count: u64,
        sum: f64,
    },
}

/// One series of a family: its label pairs in descriptor order plus the value.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub labels: Vec<(String, String)>,
    pub value: MetricValue,
}

impl MetricSample {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// A gathered family, as handed to the exposition writer.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedMetric {
    pub descriptor: MetricDescriptor,
    pub samples: Vec<MetricSample>,
}

impl CollectedMetric {
    /// First series whose labels include every `(name, value)` pair given.
    pub fn find_sample(&self, labels: &[(&str, &str)]) -> Option<&MetricSample> {
        self.samples.iter().find(|sample| {
            labels
                .iter()
                .all(|(name, value)| sample.label(name) == Some(*value))
        })
    }
}
