use std::sync::Arc;

use svcmetrics_common::{
    config::MetricsConfig,
    error::{MetricsError, Result},
    naming::{is_valid_metric_name, qualified_name},
};
use tracing::info;

use crate::{
    collectors::{BuildInfo, ProcessCollector, RuntimeCollector},
    export::RegistryExport,
    store::{
        Collector, CollectorRegistry, CounterMetric, GaugeMetric, HistogramMetric,
        SampledCounterMetric,
    },
};

/// Latency buckets in seconds shared by request and messaging instrumentation.
pub const DEFAULT_DURATION_BUCKETS: [f64; 11] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub version: String,
    pub include_runtime_metrics: bool,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            include_runtime_metrics: true,
        }
    }
}

/// Service-scoped metric factory. Every name it registers is prefixed with
/// `{service_identity}_`, and a name can be registered only once.
///
/// Build one at startup and share it (usually as `Arc<MetricRegistry>`) with every component
/// that records metrics.
pub struct MetricRegistry {
    service_identity: String,
    inner: Arc<CollectorRegistry>,
}

impl MetricRegistry {
    pub fn new(service_identity: impl Into<String>) -> Result<Self> {
        Self::with_options(service_identity, RegistryOptions::default())
    }

    pub fn with_options(
        service_identity: impl Into<String>,
        options: RegistryOptions,
    ) -> Result<Self> {
        let service_identity = service_identity.into();
        if !is_valid_metric_name(&service_identity) {
            return Err(MetricsError::InvalidMetricName(service_identity));
        }

        let registry = Self {
            service_identity,
            inner: Arc::new(CollectorRegistry::new()),
        };

        BuildInfo::register(&registry, &options.version)?;
        if options.include_runtime_metrics {
            registry.register_collector(Arc::new(ProcessCollector::register(&registry)?))?;
            registry.register_collector(Arc::new(RuntimeCollector::register(&registry)?))?;
        }

        info!(
            service = %registry.service_identity,
            version = %options.version,
            runtime_metrics = options.include_runtime_metrics,
            "metric registry initialized"
        );
        Ok(registry)
    }

    /// `Ok(None)` when metrics are disabled; instrumentation built from `None` is a pass-through.
    pub fn from_config(config: &MetricsConfig) -> Result<Option<Arc<Self>>> {
        config.validate()?;
        if !config.enabled {
            info!("metrics disabled");
            return Ok(None);
        }

        let registry = Self::with_options(
            config.service_identity.clone(),
            RegistryOptions {
                version: config.version.clone(),
                include_runtime_metrics: config.include_runtime_metrics,
            },
        )?;
        Ok(Some(Arc::new(registry)))
    }

    pub fn service_identity(&self) -> &str {
        &self.service_identity
    }

    pub fn counter(&self, name: &str, help: &str) -> Result<Arc<CounterMetric>> {
        self.counter_with_labels(name, help, &[])
    }

    pub fn counter_with_labels(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<Arc<CounterMetric>> {
        self.inner
            .register_counter(&self.qualify(name), help, labels)
    }

    pub fn gauge(&self, name: &str, help: &str) -> Result<Arc<GaugeMetric>> {
        self.gauge_with_labels(name, help, &[])
    }

    pub fn gauge_with_labels(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<Arc<GaugeMetric>> {
        self.inner.register_gauge(&self.qualify(name), help, labels)
    }

    /// Counter set from an externally maintained total instead of incremented.
    pub fn sampled_counter(&self, name: &str, help: &str) -> Result<Arc<SampledCounterMetric>> {
        self.inner.register_sampled_counter(&self.qualify(name), help, &[])
    }

    pub fn histogram_with_labels(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
        buckets: &[f64],
    ) -> Result<Arc<HistogramMetric>> {
        self.inner
            .register_histogram(&self.qualify(name), help, labels, buckets)
    }

    pub fn register_collector(&self, collector: Arc<dyn Collector>) -> Result<()> {
        self.inner.register_collector(collector)
    }

    /// Read-only view for exposition.
    pub fn export(&self) -> RegistryExport {
        RegistryExport::new(Arc::clone(&self.inner))
    }

    fn qualify(&self, name: &str) -> String {
        qualified_name(&self.service_identity, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare(service: &str) -> MetricRegistry {
        MetricRegistry::with_options(
            service,
            RegistryOptions {
                version: "1.2.3".to_string(),
                include_runtime_metrics: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn names_are_prefixed_with_service_identity() {
        let registry = bare("orders");
        let counter = registry.counter("jobs_total", "jobs").unwrap();
        assert_eq!(counter.descriptor().name, "orders_jobs_total");

        let histogram = registry
            .histogram_with_labels("wait_seconds", "wait", &["queue"], &DEFAULT_DURATION_BUCKETS)
            .unwrap();
        assert_eq!(histogram.descriptor().name, "orders_wait_seconds");
        assert_eq!(histogram.descriptor().buckets, DEFAULT_DURATION_BUCKETS.to_vec());
    }

    #[test]
    fn registering_a_name_twice_fails() {
        let registry = bare("orders");
        registry.counter("jobs_total", "jobs").unwrap();

        let err = registry
            .counter_with_labels("jobs_total", "jobs", &["kind"])
            .err()
            .unwrap();
        assert!(matches!(&err, MetricsError::DuplicateMetric(name) if name == "orders_jobs_total"));
        assert_eq!(err.to_string(), "metric already registered: orders_jobs_total");
    }

    #[test]
    fn same_logical_name_is_fine_across_registries() {
        let first = bare("orders");
        let second = bare("billing");
        first.gauge("depth", "depth").unwrap();
        second.gauge("depth", "depth").unwrap();
    }

    #[test]
    fn invalid_service_identity_is_rejected() {
        assert!(matches!(
            MetricRegistry::new("orders-api"),
            Err(MetricsError::InvalidMetricName(_))
        ));
    }

    #[test]
    fn build_info_is_always_present() {
        let registry = bare("orders");
        let text = registry.export().render();
        assert!(text.contains("orders_build_info{version=\"1.2.3\"} 1\n"));
    }

    #[test]
    fn build_info_name_is_taken() {
        let registry = bare("orders");
        assert!(registry.gauge("build_info", "clash").is_err());
    }

    #[test]
    fn runtime_metrics_are_registered_when_enabled() {
        let registry = MetricRegistry::new("orders").unwrap();
        let export = registry.export();
        assert!(export.contains("orders_process_resident_memory_bytes"));
        assert!(export.contains("orders_runtime_workers"));
        assert!(export.contains("orders_uptime_seconds"));
    }

    #[test]
    fn from_config_returns_none_when_disabled() {
        assert!(MetricRegistry::from_config(&MetricsConfig::disabled())
            .unwrap()
            .is_none());

        let mut config = MetricsConfig::new("orders");
        config.include_runtime_metrics = false;
        let registry = MetricRegistry::from_config(&config).unwrap().unwrap();
        assert_eq!(registry.service_identity(), "orders");
        assert!(!registry.export().contains("orders_process_threads"));
    }

    #[test]
    fn end_to_end_counter_line() {
        let registry = bare("orders");
        let requests = registry
            .counter_with_labels("requests_total", "Total requests", &["method", "status"])
            .unwrap();
        requests.inc_one(&["GET", "200"]);

        let text = registry.export().render();
        assert!(
            text.lines()
                .any(|line| line == "orders_requests_total{method=\"GET\",status=\"200\"} 1")
        );
    }
}
