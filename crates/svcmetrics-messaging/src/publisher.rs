use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use svcmetrics_common::context::CallContext;
use svcmetrics_registry::{CounterMetric, DEFAULT_DURATION_BUCKETS, HistogramMetric, MetricRegistry};

use crate::{
    error::Result,
    message::Message,
    observation::{MessageObservation, MessageOutcome},
    traits::Publisher,
};

pub struct PublisherMetrics {
    published_total: Arc<CounterMetric>,
    publish_errors_total: Arc<CounterMetric>,
    publish_duration_seconds: Arc<HistogramMetric>,
}

impl PublisherMetrics {
    pub fn register(registry: &MetricRegistry) -> svcmetrics_common::Result<Self> {
        Ok(Self {
            published_total: registry.counter_with_labels(
                "messages_published_total",
                "Total number of messages published successfully",
                &["topic"],
            )?,
            publish_errors_total: registry.counter_with_labels(
                "message_publish_errors_total",
                "Total number of failed publish attempts",
                &["topic"],
            )?,
            publish_duration_seconds: registry.histogram_with_labels(
                "message_publish_duration_seconds",
                "Duration of publish attempts in seconds",
                &["topic"],
                &DEFAULT_DURATION_BUCKETS,
            )?,
        })
    }

    pub fn record(&self, observation: &MessageObservation<'_>) {
        let labels = [observation.topic];
        match observation.outcome {
            MessageOutcome::PublishFailed => self.publish_errors_total.inc_one(&labels),
            _ => self.published_total.inc_one(&labels),
        }
        self.publish_duration_seconds
            .observe_duration(&labels, observation.duration);
    }

    pub fn wrap(self: &Arc<Self>, publisher: Arc<dyn Publisher>) -> Arc<dyn Publisher> {
        Arc::new(InstrumentedPublisher {
            inner: publisher,
            metrics: Arc::clone(self),
        })
    }
}

/// Returns `publisher` untouched when there is no registry.
pub fn instrument_publisher(
    registry: Option<&MetricRegistry>,
    publisher: Arc<dyn Publisher>,
) -> Result<Arc<dyn Publisher>> {
    let Some(registry) = registry else {
        return Ok(publisher);
    };

    let metrics = Arc::new(PublisherMetrics::register(registry)?);
    Ok(metrics.wrap(publisher))
}

struct InstrumentedPublisher {
    inner: Arc<dyn Publisher>,
    metrics: Arc<PublisherMetrics>,
}

#[async_trait]
impl Publisher for InstrumentedPublisher {
    async fn publish(&self, ctx: &CallContext, topic: &str, message: Message) -> Result<()> {
        let started_at = Instant::now();
        let result = self.inner.publish(ctx, topic, message).await;

        let outcome = if result.is_ok() {
            MessageOutcome::Published
        } else {
            MessageOutcome::PublishFailed
        };
        self.metrics.record(&MessageObservation {
            topic,
            outcome,
            duration: started_at.elapsed(),
        });

        result
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
