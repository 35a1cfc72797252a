pub mod collectors;
pub mod export;
pub mod exposition;
pub mod registry;
pub mod store;
pub mod types;

pub use export::RegistryExport;
pub use registry::{DEFAULT_DURATION_BUCKETS, MetricRegistry, RegistryOptions};
pub use store::{Collector, CounterMetric, GaugeMetric, HistogramMetric, SampledCounterMetric};
pub use types::{CollectedMetric, MetricDescriptor, MetricKind, MetricSample, MetricValue};
