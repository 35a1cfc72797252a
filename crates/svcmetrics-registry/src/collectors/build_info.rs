use svcmetrics_common::error::Result;

use crate::registry::MetricRegistry;

pub struct BuildInfo;

impl BuildInfo {
    /// Registers `{service}_build_info{version="..."} 1`.
    pub fn register(registry: &MetricRegistry, version: &str) -> Result<()> {
        let gauge = registry.gauge_with_labels(
            "build_info",
            "Build information; the value is always 1",
            &["version"],
        )?;
        gauge.set(&[version], 1.0);
        Ok(())
    }
}
