use std::sync::Arc;

use crate::{store::CollectorRegistry, types::CollectedMetric};

/// Read-only handle over a registry's collectors. It can snapshot and render but never
/// register or remove metrics.
#[derive(Clone)]
pub struct RegistryExport {
    inner: Arc<CollectorRegistry>,
}

impl RegistryExport {
    pub(crate) fn new(inner: Arc<CollectorRegistry>) -> Self {
        Self { inner }
    }

    pub fn gather(&self) -> Vec<CollectedMetric> {
        self.inner.gather()
    }

    pub fn render(&self) -> String {
        self.inner.render()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains(name)
    }

    pub fn family_count(&self) -> usize {
        self.inner.len()
    }
}
