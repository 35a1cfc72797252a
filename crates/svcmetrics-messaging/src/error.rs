use svcmetrics_common::error::MetricsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("messaging backend closed")]
    Closed,
    #[error("operation on topic {topic} cancelled")]
    Cancelled { topic: String },
    #[error("publish to topic {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("subscribe to topic {topic} failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },
    #[error("internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

pub type Result<T> = std::result::Result<T, MessagingError>;
