use std::{sync::Arc, time::Instant};

use svcmetrics_common::error::Result;
use tokio::runtime::Handle;

use crate::{
    registry::MetricRegistry,
    store::{Collector, GaugeMetric},
};

/// Async runtime gauges. Values are only updated when the scrape runs inside a tokio runtime.
pub struct RuntimeCollector {
    start_time: Instant,
    uptime_seconds: Arc<GaugeMetric>,
    workers: Arc<GaugeMetric>,
    alive_tasks: Arc<GaugeMetric>,
}

impl RuntimeCollector {
    pub fn register(registry: &MetricRegistry) -> Result<Self> {
        Ok(Self {
            start_time: Instant::now(),
            uptime_seconds: registry.gauge("uptime_seconds", "Process uptime in seconds")?,
            workers: registry.gauge(
                "runtime_workers",
                "Number of worker threads used by the async runtime",
            )?,
            alive_tasks: registry.gauge(
                "runtime_alive_tasks",
                "Number of tasks currently alive in the async runtime",
            )?,
        })
    }
}

impl Collector for RuntimeCollector {
    fn refresh(&self) {
        self.uptime_seconds
            .set(&[], self.start_time.elapsed().as_secs_f64());

        if let Ok(handle) = Handle::try_current() {
            let metrics = handle.metrics();
            self.workers.set(&[], metrics.num_workers() as f64);
            self.alive_tasks.set(&[], metrics.num_alive_tasks() as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use svcmetrics_common::error::Result;

    use crate::registry::RegistryOptions;

    use super::*;

    fn registry() -> Result<MetricRegistry> {
        MetricRegistry::with_options(
            "svc",
            RegistryOptions {
                include_runtime_metrics: false,
                ..RegistryOptions::default()
            },
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn refresh_reads_current_runtime() {
        let registry = registry().unwrap();
        let collector = RuntimeCollector::register(&registry).unwrap();
        collector.refresh();

        assert_eq!(collector.workers.get(&[]), 2.0);
        assert!(collector.uptime_seconds.get(&[]) >= 0.0);
    }

    #[test]
    fn refresh_outside_runtime_keeps_uptime_only() {
        let registry = registry().unwrap();
        let collector = RuntimeCollector::register(&registry).unwrap();
        collector.refresh();

        assert_eq!(collector.workers.get(&[]), 0.0);
    }
}
