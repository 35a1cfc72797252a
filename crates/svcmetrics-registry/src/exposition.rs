//! Text exposition format (version 0.0.4) rendering.

use crate::types::{CollectedMetric, MetricValue};

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn render(metrics: &[CollectedMetric]) -> String {
    let mut output = String::new();

    for metric in metrics {
        output.push_str("# HELP ");
        output.push_str(&metric.descriptor.name);
        output.push(' ');
        output.push_str(&escape_help(&metric.descriptor.help));
        output.push('\n');

        output.push_str("# TYPE ");
        output.push_str(&metric.descriptor.name);
        output.push(' ');
        output.push_str(metric.descriptor.kind.as_str());
        output.push('\n');

        for sample in &metric.samples {
            match &sample.value {
                MetricValue::Counter(value) | MetricValue::Gauge(value) => {
                    output.push_str(&render_sample_line(
                        &metric.descriptor.name,
                        &sample.labels,
                        *value,
                    ));
                }
                MetricValue::Histogram {
                    buckets,
                    count,
                    sum,
                } => {
                    let mut cumulative = 0_u64;
                    for (bound, bucket_count) in buckets {
                        cumulative = cumulative.saturating_add(*bucket_count);
                        let mut labels = sample.labels.clone();
                        labels.push(("le".to_string(), format_bucket_bound(*bound)));
                        output.push_str(&render_sample_line(
                            &format!("{}_bucket", metric.descriptor.name),
                            &labels,
                            cumulative as f64,
                        ));
                    }

                    output.push_str(&render_sample_line(
                        &format!("{}_sum", metric.descriptor.name),
                        &sample.labels,
                        *sum,
                    ));
                    output.push_str(&render_sample_line(
                        &format!("{}_count", metric.descriptor.name),
                        &sample.labels,
                        *count as f64,
                    ));
                }
            }
        }
    }

    output
}

fn render_sample_line(name: &str, labels: &[(String, String)], value: f64) -> String {
    let mut rendered = String::new();
    rendered.push_str(name);

    if !labels.is_empty() {
        rendered.push('{');
        for (index, (key, value)) in labels.iter().enumerate() {
            if index > 0 {
                rendered.push(',');
            }
            rendered.push_str(key);
            rendered.push_str("=\"");
            rendered.push_str(&escape_label_value(value));
            rendered.push('"');
        }
        rendered.push('}');
    }

    rendered.push(' ');
    rendered.push_str(&format_metric_value(value));
    rendered.push('\n');
    rendered
}

fn format_metric_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        let sign = if value > 0.0 { "+" } else { "-" };
        format!("{sign}Inf")
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

fn format_bucket_bound(value: f64) -> String {
    if value.is_infinite() {
        "+Inf".to_string()
    } else {
        value.to_string()
    }
}

fn escape_help(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}
