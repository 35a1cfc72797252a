use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use svcmetrics_common::error::Result;

use crate::{
    registry::MetricRegistry,
    store::{Collector, GaugeMetric, SampledCounterMetric},
};

/// Kernel clock ticks per second; USER_HZ is 100 on every mainstream Linux target.
const CLOCK_TICKS_PER_SECOND: f64 = 100.0;

/// Process resource usage read from procfs at scrape time. On platforms without procfs the
/// gauges stay at their last value (zero).
pub struct ProcessCollector {
    resident_memory_bytes: Arc<GaugeMetric>,
    virtual_memory_bytes: Arc<GaugeMetric>,
    open_fds: Arc<GaugeMetric>,
    threads: Arc<GaugeMetric>,
    cpu_seconds_total: Arc<SampledCounterMetric>,
    start_time_seconds: Arc<GaugeMetric>,
}

impl ProcessCollector {
    pub fn register(registry: &MetricRegistry) -> Result<Self> {
        let collector = Self {
            resident_memory_bytes: registry.gauge(
                "process_resident_memory_bytes",
                "Resident memory size of the process in bytes",
            )?,
            virtual_memory_bytes: registry.gauge(
                "process_virtual_memory_bytes",
                "Virtual memory size of the process in bytes",
            )?,
            open_fds: registry.gauge("process_open_fds", "Number of open file descriptors")?,
            threads: registry.gauge("process_threads", "Number of OS threads in the process")?,
            cpu_seconds_total: registry.sampled_counter(
                "process_cpu_seconds_total",
                "Total user and system CPU time spent in seconds",
            )?,
            start_time_seconds: registry.gauge(
                "process_start_time_seconds",
                "Start time of the process since unix epoch in seconds",
            )?,
        };

        let start_time = read_process_stat()
            .and_then(|stat| process_start_time_seconds(stat.start_ticks))
            .or_else(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .ok()
                    .map(|elapsed| elapsed.as_secs_f64())
            });
        if let Some(start_time) = start_time {
            collector.start_time_seconds.set(&[], start_time);
        }

        Ok(collector)
    }
}

impl Collector for ProcessCollector {
    fn refresh(&self) {
        if let Some(status) = read_process_status() {
            if let Some(bytes) = status.resident_bytes {
                self.resident_memory_bytes.set(&[], bytes as f64);
            }
            if let Some(bytes) = status.virtual_bytes {
                self.virtual_memory_bytes.set(&[], bytes as f64);
            }
            if let Some(threads) = status.threads {
                self.threads.set(&[], threads as f64);
            }
        }

        if let Some(stat) = read_process_stat() {
            self.cpu_seconds_total.set_total(
                &[],
                (stat.user_ticks + stat.system_ticks) as f64 / CLOCK_TICKS_PER_SECOND,
            );
        }

        if let Some(count) = count_open_fds() {
            self.open_fds.set(&[], count as f64);
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct ProcessStatus {
    resident_bytes: Option<u64>,
    virtual_bytes: Option<u64>,
    threads: Option<u64>,
}

#[derive(Debug, PartialEq)]
struct ProcessStat {
    user_ticks: u64,
    system_ticks: u64,
    start_ticks: u64,
}

fn parse_status(status: &str) -> ProcessStatus {
    let mut parsed = ProcessStatus::default();
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            parsed.resident_bytes = parse_kib(rest);
        } else if let Some(rest) = line.strip_prefix("VmSize:") {
            parsed.virtual_bytes = parse_kib(rest);
        } else if let Some(rest) = line.strip_prefix("Threads:") {
            parsed.threads = rest.trim().parse().ok();
        }
    }
    parsed
}

fn parse_kib(value: &str) -> Option<u64> {
    value
        .split_whitespace()
        .next()
        .and_then(|kb| kb.parse::<u64>().ok())?
        .checked_mul(1024)
}

/// Parses `/proc/self/stat`. The command name may contain spaces, so fields are counted from
/// the last closing parenthesis.
fn parse_stat(stat: &str) -> Option<ProcessStat> {
    let (_, rest) = stat.rsplit_once(')')?;
    let fields = rest.split_whitespace().collect::<Vec<_>>();

    // fields[0] is the state (field 3 in proc(5)).
    let field = |number: usize| fields.get(number - 3)?.parse::<u64>().ok();
    Some(ProcessStat {
        user_ticks: field(14)?,
        system_ticks: field(15)?,
        start_ticks: field(22)?,
    })
}

#[cfg(target_os = "linux")]
fn read_process_status() -> Option<ProcessStatus> {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .map(|status| parse_status(&status))
}

#[cfg(not(target_os = "linux"))]
fn read_process_status() -> Option<ProcessStatus> {
    None
}

#[cfg(target_os = "linux")]
fn read_process_stat() -> Option<ProcessStat> {
    parse_stat(&std::fs::read_to_string("/proc/self/stat").ok()?)
}

#[cfg(not(target_os = "linux"))]
fn read_process_stat() -> Option<ProcessStat> {
    None
}

#[cfg(target_os = "linux")]
fn process_start_time_seconds(start_ticks: u64) -> Option<f64> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let boot_time = stat
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(boot_time as f64 + start_ticks as f64 / CLOCK_TICKS_PER_SECOND)
}

#[cfg(not(target_os = "linux"))]
fn process_start_time_seconds(_start_ticks: u64) -> Option<f64> {
    None
}

#[cfg(target_os = "linux")]
fn count_open_fds() -> Option<usize> {
    std::fs::read_dir("/proc/self/fd")
        .ok()
        .map(|entries| entries.count())
}

#[cfg(not(target_os = "linux"))]
fn count_open_fds() -> Option<usize> {
    None
}
