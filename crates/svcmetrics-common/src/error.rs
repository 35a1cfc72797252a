use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric already registered: {0}")]
    DuplicateMetric(String),
    #[error("invalid metric name: {0}")]
    InvalidMetricName(String),
    #[error("invalid metrics config: {0}")]
    InvalidConfig(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, MetricsError>;
