use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use svcmetrics_common::{
    error::{MetricsError, Result},
    naming::{is_valid_label_name, is_valid_metric_name},
};
use tracing::{debug, error};

use crate::{
    exposition,
    types::{CollectedMetric, MetricDescriptor, MetricKind, MetricSample, MetricValue},
};

type LabelValues = Vec<String>;

trait RegisteredMetric: Send + Sync {
    fn descriptor(&self) -> &MetricDescriptor;
    fn collect(&self) -> Vec<MetricSample>;
}

/// Sampled state refreshed right before every gather, e.g. process memory gauges.
pub trait Collector: Send + Sync {
    fn refresh(&self);
}

/// Name-keyed store of every metric family. Names are taken as given; namespacing is
/// applied by [`crate::MetricRegistry`].
pub struct CollectorRegistry {
    metrics: RwLock<HashMap<String, Arc<dyn RegisteredMetric>>>,
    collectors: RwLock<Vec<Arc<dyn Collector>>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            collectors: RwLock::new(Vec::new()),
        }
    }

    pub fn register_counter(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
    ) -> Result<Arc<CounterMetric>> {
        let descriptor = build_descriptor(name, help, MetricKind::Counter, variable_labels, &[])?;
        let metric = Arc::new(CounterMetric::new(descriptor));
        self.register(metric.clone())?;
        Ok(metric)
    }

    pub fn register_gauge(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
    ) -> Result<Arc<GaugeMetric>> {
        let descriptor = build_descriptor(name, help, MetricKind::Gauge, variable_labels, &[])?;
        let metric = Arc::new(GaugeMetric::new(descriptor));
        self.register(metric.clone())?;
        Ok(metric)
    }

    pub fn register_sampled_counter(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
    ) -> Result<Arc<SampledCounterMetric>> {
        let descriptor = build_descriptor(name, help, MetricKind::Counter, variable_labels, &[])?;
        let metric = Arc::new(SampledCounterMetric::new(descriptor));
        self.register(metric.clone())?;
        Ok(metric)
    }

    pub fn register_histogram(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
        buckets: &[f64],
    ) -> Result<Arc<HistogramMetric>> {
        let descriptor =
            build_descriptor(name, help, MetricKind::Histogram, variable_labels, buckets)?;
        let metric = Arc::new(HistogramMetric::new(descriptor));
        self.register(metric.clone())?;
        Ok(metric)
    }

    pub fn register_collector(&self, collector: Arc<dyn Collector>) -> Result<()> {
        let mut collectors = self.collectors.write().map_err(|_| {
            MetricsError::InternalError("failed to acquire collector list lock".to_string())
        })?;
        collectors.push(collector);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.metrics
            .read()
            .map(|metrics| metrics.contains_key(name))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.metrics.read().map(|metrics| metrics.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refreshes collectors, then snapshots every family sorted by name.
    pub fn gather(&self) -> Vec<CollectedMetric> {
        if let Ok(collectors) = self.collectors.read() {
            for collector in collectors.iter() {
                collector.refresh();
            }
        }

        let metrics = match self.metrics.read() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };

        let mut collected = metrics
            .values()
            .map(|metric| CollectedMetric {
                descriptor: metric.descriptor().clone(),
                samples: metric.collect(),
            })
            .collect::<Vec<_>>();

        collected.sort_by(|left, right| left.descriptor.name.cmp(&right.descriptor.name));
        collected
    }

    pub fn render(&self) -> String {
        exposition::render(&self.gather())
    }

    fn register<M: RegisteredMetric + 'static>(&self, metric: Arc<M>) -> Result<()> {
        let name = metric.descriptor().name.clone();
        let mut metrics = self.metrics.write().map_err(|_| {
            MetricsError::InternalError("failed to acquire metrics registry lock".to_string())
        })?;

        if metrics.contains_key(&name) {
            error!(metric = %name, "metric already registered");
            return Err(MetricsError::DuplicateMetric(name));
        }

        debug!(metric = %name, "registered metric");
        metrics.insert(name, metric);
        Ok(())
    }
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CounterMetric {
    descriptor: MetricDescriptor,
    series: RwLock<HashMap<LabelValues, Arc<AtomicU64>>>,
}

impl CounterMetric {
    fn new(descriptor: MetricDescriptor) -> Self {
        Self {
            descriptor,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    pub fn inc(&self, labels: &[&str], value: u64) {
        let series = get_or_create_series(&self.series, &self.descriptor, labels, || {
            AtomicU64::new(0)
        });
        series.fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc_one(&self, labels: &[&str]) {
        self.inc(labels, 1);
    }

    /// Current value of one series; zero if it was never touched.
    pub fn get(&self, labels: &[&str]) -> u64 {
        lookup_series(&self.series, &self.descriptor, labels)
            .map(|value| value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl RegisteredMetric for CounterMetric {
    fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    fn collect(&self) -> Vec<MetricSample> {
        collect_series(&self.series, &self.descriptor, |value| {
            MetricValue::Counter(value.load(Ordering::Relaxed) as f64)
        })
    }
}

/// Gauge values are `f64` stored as raw bits.
pub struct GaugeMetric {
    descriptor: MetricDescriptor,
    series: RwLock<HashMap<LabelValues, Arc<AtomicU64>>>,
}

impl GaugeMetric {
    fn new(descriptor: MetricDescriptor) -> Self {
        Self {
            descriptor,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    pub fn set(&self, labels: &[&str], value: f64) {
        let series = get_or_create_series(&self.series, &self.descriptor, labels, zero_bits);
        series.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn inc(&self, labels: &[&str], value: f64) {
        let series = get_or_create_series(&self.series, &self.descriptor, labels, zero_bits);
        let _ = series.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
            Some((f64::from_bits(bits) + value).to_bits())
        });
    }

    pub fn dec(&self, labels: &[&str], value: f64) {
        self.inc(labels, -value);
    }

    pub fn get(&self, labels: &[&str]) -> f64 {
        lookup_series(&self.series, &self.descriptor, labels)
            .map(|bits| f64::from_bits(bits.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }
}

impl RegisteredMetric for GaugeMetric {
    fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    fn collect(&self) -> Vec<MetricSample> {
        collect_series(&self.series, &self.descriptor, |bits| {
            MetricValue::Gauge(f64::from_bits(bits.load(Ordering::Relaxed)))
        })
    }
}

/// Counter whose running total is read from elsewhere, e.g. CPU seconds from the kernel.
/// A sample below the current total is ignored so the series never goes backwards.
pub struct SampledCounterMetric {
    descriptor: MetricDescriptor,
    series: RwLock<HashMap<LabelValues, Arc<AtomicU64>>>,
}

impl SampledCounterMetric {
    fn new(descriptor: MetricDescriptor) -> Self {
        Self {
            descriptor,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    pub fn set_total(&self, labels: &[&str], total: f64) {
        let series = get_or_create_series(&self.series, &self.descriptor, labels, zero_bits);
        let _ = series.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
            (total > f64::from_bits(bits)).then(|| total.to_bits())
        });
    }

    pub fn get(&self, labels: &[&str]) -> f64 {
        lookup_series(&self.series, &self.descriptor, labels)
            .map(|bits| f64::from_bits(bits.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }
}

impl RegisteredMetric for SampledCounterMetric {
    fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    fn collect(&self) -> Vec<MetricSample> {
        collect_series(&self.series, &self.descriptor, |bits| {
            MetricValue::Counter(f64::from_bits(bits.load(Ordering::Relaxed)))
        })
    }
}

pub struct HistogramMetric {
    descriptor: MetricDescriptor,
    series: RwLock<HashMap<LabelValues, Arc<Mutex<HistogramSeries>>>>,
}

/// Buckets, count and sum of one series change together under the series lock.
struct HistogramSeries {
    bucket_counts: Vec<u64>,
    count: u64,
    sum: f64,
}

impl HistogramSeries {
    fn new(bucket_len: usize) -> Self {
        Self {
            bucket_counts: vec![0; bucket_len + 1],
            count: 0,
            sum: 0.0,
        }
    }
}

impl HistogramMetric {
    fn new(descriptor: MetricDescriptor) -> Self {
        Self {
            descriptor,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    pub fn observe(&self, labels: &[&str], value: f64) {
        let buckets = &self.descriptor.buckets;
        let series = get_or_create_series(&self.series, &self.descriptor, labels, || {
            Mutex::new(HistogramSeries::new(buckets.len()))
        });

        let bucket_index = buckets
            .iter()
            .position(|bucket| value <= *bucket)
            .unwrap_or(buckets.len());

        let Ok(mut series) = series.lock() else {
            return;
        };
        if let Some(bucket) = series.bucket_counts.get_mut(bucket_index) {
            *bucket += 1;
        }
        series.count += 1;
        series.sum += value;
    }

    pub fn observe_duration(&self, labels: &[&str], elapsed: Duration) {
        self.observe(labels, elapsed.as_secs_f64());
    }

    /// Number of observations recorded for one series.
    pub fn sample_count(&self, labels: &[&str]) -> u64 {
        lookup_series(&self.series, &self.descriptor, labels)
            .and_then(|series| series.lock().ok().map(|series| series.count))
            .unwrap_or(0)
    }
}

impl RegisteredMetric for HistogramMetric {
    fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    fn collect(&self) -> Vec<MetricSample> {
        let bounds = &self.descriptor.buckets;
        collect_series(&self.series, &self.descriptor, |entry| {
            let Ok(entry) = entry.lock() else {
                return MetricValue::Histogram {
                    buckets: Vec::new(),
                    count: 0,
                    sum: 0.0,
                };
            };

            let mut buckets = bounds
                .iter()
                .copied()
                .zip(entry.bucket_counts.iter().copied())
                .collect::<Vec<_>>();
            let inf_count = entry.bucket_counts.get(bounds.len()).copied().unwrap_or(0);
            buckets.push((f64::INFINITY, inf_count));

            MetricValue::Histogram {
                buckets,
                count: entry.count,
                sum: entry.sum,
            }
        })
    }
}

fn build_descriptor(
    name: &str,
    help: &str,
    kind: MetricKind,
    variable_labels: &[&str],
    buckets: &[f64],
) -> Result<MetricDescriptor> {
    if !is_valid_metric_name(name) {
        return Err(MetricsError::InvalidMetricName(name.to_string()));
    }

    for (index, label) in variable_labels.iter().enumerate() {
        if !is_valid_label_name(label) || variable_labels[..index].contains(label) {
            return Err(MetricsError::InvalidMetricName(format!(
                "{name}: bad label name {label:?}"
            )));
        }
        if kind == MetricKind::Histogram && *label == "le" {
            return Err(MetricsError::InvalidMetricName(format!(
                "{name}: histogram label \"le\" is reserved"
            )));
        }
    }

    let mut sorted_buckets = buckets
        .iter()
        .copied()
        .filter(|bound| bound.is_finite())
        .collect::<Vec<_>>();
    sorted_buckets.sort_by(|left, right| left.total_cmp(right));
    sorted_buckets.dedup();

    Ok(MetricDescriptor {
        name: name.to_string(),
        help: help.to_string(),
        kind,
        variable_labels: variable_labels.iter().map(|label| (*label).to_string()).collect(),
        buckets: sorted_buckets,
    })
}

fn zero_bits() -> AtomicU64 {
    AtomicU64::new(0.0_f64.to_bits())
}

fn get_or_create_series<T>(
    series: &RwLock<HashMap<LabelValues, Arc<T>>>,
    descriptor: &MetricDescriptor,
    labels: &[&str],
    init: impl FnOnce() -> T,
) -> Arc<T> {
    let label_values = normalize_labels(descriptor, labels);
    if let Ok(guard) = series.read()
        && let Some(existing) = guard.get(&label_values)
    {
        return existing.clone();
    }

    match series.write() {
        Ok(mut guard) => guard
            .entry(label_values)
            .or_insert_with(|| Arc::new(init()))
            .clone(),
        Err(_) => Arc::new(init()),
    }
}

fn lookup_series<T>(
    series: &RwLock<HashMap<LabelValues, Arc<T>>>,
    descriptor: &MetricDescriptor,
    labels: &[&str],
) -> Option<Arc<T>> {
    let label_values = normalize_labels(descriptor, labels);
    series.read().ok()?.get(&label_values).cloned()
}

fn collect_series<T>(
    series: &RwLock<HashMap<LabelValues, Arc<T>>>,
    descriptor: &MetricDescriptor,
    value_of: impl Fn(&T) -> MetricValue,
) -> Vec<MetricSample> {
    let series = match series.read() {
        Ok(guard) => guard,
        Err(_) => return Vec::new(),
    };

    let mut entries = series.iter().collect::<Vec<_>>();
    entries.sort_by(|left, right| left.0.cmp(right.0));

    entries
        .into_iter()
        .map(|(label_values, entry)| MetricSample {
            labels: materialize_labels(descriptor, label_values),
            value: value_of(&**entry),
        })
        .collect()
}

fn normalize_labels(descriptor: &MetricDescriptor, labels: &[&str]) -> LabelValues {
    let expected = descriptor.variable_labels.len();
    (0..expected)
        .map(|index| labels.get(index).copied().unwrap_or_default().to_string())
        .collect()
}

fn materialize_labels(descriptor: &MetricDescriptor, values: &[String]) -> Vec<(String, String)> {
    descriptor
        .variable_labels
        .iter()
        .zip(values.iter())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
