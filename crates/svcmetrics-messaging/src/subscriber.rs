//! Subscriber instrumentation.
//!
//! Every `subscribe` spawns one relay task that moves messages from the wrapped stream to a
//! fresh output stream, strictly one at a time: the next source message is not pulled until
//! the current one is acked, nacked, or the subscription context is cancelled. Consumption is
//! therefore paced by downstream acknowledgment and the relay buffers nothing of its own.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use svcmetrics_common::context::CallContext;
use svcmetrics_registry::{CounterMetric, DEFAULT_DURATION_BUCKETS, HistogramMetric, MetricRegistry};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    error::Result,
    message::{AckOutcome, InboundMessage, MessageStream},
    observation::{MessageObservation, MessageOutcome},
    traits::Subscriber,
};

pub struct SubscriberMetrics {
    consumed_total: Arc<CounterMetric>,
    acks_total: Arc<CounterMetric>,
    nacks_total: Arc<CounterMetric>,
    consume_duration_seconds: Arc<HistogramMetric>,
    subscribe_errors_total: Arc<CounterMetric>,
}

impl SubscriberMetrics {
    pub fn register(registry: &MetricRegistry) -> svcmetrics_common::Result<Self> {
        Ok(Self {
            consumed_total: registry.counter_with_labels(
                "messages_consumed_total",
                "Total number of messages received from subscriptions",
                &["topic"],
            )?,
            acks_total: registry.counter_with_labels(
                "message_acks_total",
                "Total number of consumed messages acknowledged",
                &["topic"],
            )?,
            nacks_total: registry.counter_with_labels(
                "message_nacks_total",
                "Total number of consumed messages rejected",
                &["topic"],
            )?,
            consume_duration_seconds: registry.histogram_with_labels(
                "message_consume_duration_seconds",
                "Time from receiving a message to its acknowledgment in seconds",
                &["topic"],
                &DEFAULT_DURATION_BUCKETS,
            )?,
            subscribe_errors_total: registry.counter_with_labels(
                "subscribe_errors_total",
                "Total number of subscriptions that could not be established",
                &["topic"],
            )?,
        })
    }

    pub fn record(&self, observation: &MessageObservation<'_>) {
        let labels = [observation.topic];
        let counter = match observation.outcome {
            MessageOutcome::Acked => &self.acks_total,
            MessageOutcome::Nacked => &self.nacks_total,
            MessageOutcome::Published | MessageOutcome::PublishFailed => return,
        };
        self.consume_duration_seconds
            .observe_duration(&labels, observation.duration);
        counter.inc_one(&labels);
    }

    pub fn wrap(self: &Arc<Self>, subscriber: Arc<dyn Subscriber>) -> Arc<dyn Subscriber> {
        Arc::new(InstrumentedSubscriber {
            inner: subscriber,
            metrics: Arc::clone(self),
        })
    }
}

/// Returns `subscriber` untouched when there is no registry.
pub fn instrument_subscriber(
    registry: Option<&MetricRegistry>,
    subscriber: Arc<dyn Subscriber>,
) -> Result<Arc<dyn Subscriber>> {
    let Some(registry) = registry else {
        return Ok(subscriber);
    };

    let metrics = Arc::new(SubscriberMetrics::register(registry)?);
    Ok(metrics.wrap(subscriber))
}

struct InstrumentedSubscriber {
    inner: Arc<dyn Subscriber>,
    metrics: Arc<SubscriberMetrics>,
}

#[async_trait]
impl Subscriber for InstrumentedSubscriber {
    async fn subscribe(&self, ctx: &CallContext, topic: &str) -> Result<MessageStream> {
        let source = match self.inner.subscribe(ctx, topic).await {
            Ok(source) => source,
            Err(err) => {
                self.metrics.subscribe_errors_total.inc_one(&[topic]);
                warn!(topic, error = %err, "failed to establish subscription");
                return Err(err);
            }
        };

        // Capacity 1 is the smallest tokio allows; the relay never has a second message to put
        // in it because it waits for the first one's outcome.
        let (output, stream) = mpsc::channel(1);
        let relay = Relay {
            topic: topic.to_string(),
            ctx: ctx.clone(),
            metrics: Arc::clone(&self.metrics),
        };
        tokio::spawn(relay.run(source, output));

        Ok(stream)
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Per-message relay state, dropped once the outcome is recorded or the relay stops.
struct InFlight {
    id: String,
    started_at: Instant,
    forwarded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayExit {
    SourceClosed,
    Cancelled,
    DownstreamClosed,
}

struct Relay {
    topic: String,
    ctx: CallContext,
    metrics: Arc<SubscriberMetrics>,
}

impl Relay {
    async fn run(self, mut source: MessageStream, output: mpsc::Sender<InboundMessage>) {
        debug!(topic = %self.topic, "subscription relay started");
        let exit = self.relay(&mut source, &output).await;
        debug!(topic = %self.topic, ?exit, "subscription relay stopped");
        // Dropping `output` ends the downstream stream.
    }

    async fn relay(
        &self,
        source: &mut MessageStream,
        output: &mpsc::Sender<InboundMessage>,
    ) -> RelayExit {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.ctx.cancelled() => return RelayExit::Cancelled,
                next = source.recv() => match next {
                    Some(message) => message,
                    None => return RelayExit::SourceClosed,
                },
            };

            self.metrics.consumed_total.inc_one(&[self.topic.as_str()]);
            let mut in_flight = InFlight {
                id: message.id().to_string(),
                started_at: Instant::now(),
                forwarded: false,
            };

            tokio::select! {
                biased;
                _ = self.ctx.cancelled() => return RelayExit::Cancelled,
                sent = output.send(message.clone()) => {
                    if sent.is_err() {
                        debug!(
                            topic = %self.topic,
                            message_id = %in_flight.id,
                            "downstream dropped before delivery"
                        );
                        return RelayExit::DownstreamClosed;
                    }
                    in_flight.forwarded = true;
                }
            }

            let outcome = tokio::select! {
                biased;
                _ = self.ctx.cancelled() => {
                    debug!(
                        topic = %self.topic,
                        message_id = %in_flight.id,
                        forwarded = in_flight.forwarded,
                        "subscription cancelled before acknowledgment"
                    );
                    return RelayExit::Cancelled;
                }
                outcome = message.outcome() => match outcome {
                    AckOutcome::Acked => MessageOutcome::Acked,
                    AckOutcome::Nacked => MessageOutcome::Nacked,
                },
            };
            self.metrics.record(&MessageObservation {
                topic: &self.topic,
                outcome,
                duration: in_flight.started_at.elapsed(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use svcmetrics_registry::RegistryOptions;
    use tokio::time::timeout;

    use crate::{error::MessagingError, message::Message};

    use super::*;

    const QUIET: Duration = Duration::from_millis(50);
    const PATIENT: Duration = Duration::from_secs(2);

    /// Hands out one pre-built stream, or fails when none is queued.
    #[derive(Default)]
    struct ScriptedSubscriber {
        stream: Mutex<Option<MessageStream>>,
        closes: AtomicUsize,
    }

    impl ScriptedSubscriber {
        fn with_stream(stream: MessageStream) -> Self {
            Self {
                stream: Mutex::new(Some(stream)),
                closes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Subscriber for ScriptedSubscriber {
        async fn subscribe(&self, _ctx: &CallContext, topic: &str) -> Result<MessageStream> {
            self.stream
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| MessagingError::SubscribeFailed {
                    topic: topic.to_string(),
                    reason: "no route to broker".to_string(),
                })
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Err(MessagingError::Closed)
        }
    }

    fn registry() -> MetricRegistry {
        MetricRegistry::with_options(
            "orders",
            RegistryOptions {
                include_runtime_metrics: false,
                ..RegistryOptions::default()
            },
        )
        .unwrap()
    }

    fn source_with(
        count: usize,
        ctx: &CallContext,
    ) -> (mpsc::Sender<InboundMessage>, MessageStream) {
        let (sender, receiver) = mpsc::channel(count.max(1));
        for index in 0..count {
            let message = InboundMessage::new(
                Message::new(format!("payload-{index}")).with_id(format!("m-{index}")),
                "created",
                ctx.clone(),
            );
            sender.try_send(message).unwrap();
        }
        (sender, receiver)
    }

    fn instrumented(stream: MessageStream) -> (Arc<SubscriberMetrics>, Arc<dyn Subscriber>) {
        let registry = registry();
        let metrics = Arc::new(SubscriberMetrics::register(&registry).unwrap());
        let subscriber = metrics.wrap(Arc::new(ScriptedSubscriber::with_stream(stream)));
        (metrics, subscriber)
    }

    #[tokio::test]
    async fn all_acked_messages_are_accounted() {
        let ctx = CallContext::new();
        let (sender, source) = source_with(5, &ctx);
        drop(sender);
        let (metrics, subscriber) = instrumented(source);

        let mut stream = subscriber.subscribe(&ctx, "created").await.unwrap();
        let mut seen = Vec::new();
        while let Some(message) = timeout(PATIENT, stream.recv()).await.unwrap() {
            seen.push(message.id().to_string());
            assert!(message.ack());
        }

        assert_eq!(seen, ["m-0", "m-1", "m-2", "m-3", "m-4"]);
        assert_eq!(metrics.consumed_total.get(&["created"]), 5);
        assert_eq!(metrics.acks_total.get(&["created"]), 5);
        assert_eq!(metrics.nacks_total.get(&["created"]), 0);
        assert_eq!(metrics.consume_duration_seconds.sample_count(&["created"]), 5);
    }

    #[tokio::test]
    async fn nacks_are_counted_separately() {
        let ctx = CallContext::new();
        let (sender, source) = source_with(3, &ctx);
        drop(sender);
        let (metrics, subscriber) = instrumented(source);

        let mut stream = subscriber.subscribe(&ctx, "created").await.unwrap();
        let mut index = 0;
        while let Some(message) = timeout(PATIENT, stream.recv()).await.unwrap() {
            if index == 1 {
                message.nack();
            } else {
                message.ack();
            }
            index += 1;
        }

        assert_eq!(metrics.consumed_total.get(&["created"]), 3);
        assert_eq!(metrics.acks_total.get(&["created"]), 2);
        assert_eq!(metrics.nacks_total.get(&["created"]), 1);
        assert_eq!(metrics.consume_duration_seconds.sample_count(&["created"]), 3);
    }

    #[tokio::test]
    async fn next_message_waits_for_acknowledgment() {
        let ctx = CallContext::new();
        let (_sender, source) = source_with(2, &ctx);
        let (metrics, subscriber) = instrumented(source);

        let mut stream = subscriber.subscribe(&ctx, "created").await.unwrap();
        let first = timeout(PATIENT, stream.recv()).await.unwrap().unwrap();
        assert_eq!(first.id(), "m-0");

        assert!(timeout(QUIET, stream.recv()).await.is_err());
        assert_eq!(metrics.consumed_total.get(&["created"]), 1);

        first.ack();
        let second = timeout(PATIENT, stream.recv()).await.unwrap().unwrap();
        assert_eq!(second.id(), "m-1");
        assert_eq!(metrics.acks_total.get(&["created"]), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_relay_without_an_outcome() {
        let ctx = CallContext::new();
        let (_sender, source) = source_with(2, &ctx);
        let (metrics, subscriber) = instrumented(source);

        let mut stream = subscriber.subscribe(&ctx, "created").await.unwrap();
        let first = timeout(PATIENT, stream.recv()).await.unwrap().unwrap();

        ctx.cancel();
        assert!(timeout(PATIENT, stream.recv()).await.unwrap().is_none());

        // Late settlement of the abandoned message is not recorded.
        first.ack();
        tokio::task::yield_now().await;
        assert_eq!(metrics.consumed_total.get(&["created"]), 1);
        assert_eq!(metrics.acks_total.get(&["created"]), 0);
        assert_eq!(metrics.nacks_total.get(&["created"]), 0);
        assert_eq!(metrics.consume_duration_seconds.sample_count(&["created"]), 0);
    }

    #[tokio::test]
    async fn source_end_closes_the_output_stream() {
        let ctx = CallContext::new();
        let (sender, source) = source_with(0, &ctx);
        let (_, subscriber) = instrumented(source);

        let mut stream = subscriber.subscribe(&ctx, "created").await.unwrap();
        drop(sender);
        assert!(timeout(PATIENT, stream.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn message_acked_after_the_stream_is_dropped_is_counted() {
        let ctx = CallContext::new();
        let (sender, source) = source_with(1, &ctx);
        let (metrics, subscriber) = instrumented(source);

        let mut stream = subscriber.subscribe(&ctx, "created").await.unwrap();
        let first = timeout(PATIENT, stream.recv()).await.unwrap().unwrap();
        drop(stream);

        assert!(first.ack());
        timeout(PATIENT, async {
            while metrics.acks_total.get(&["created"]) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(metrics.consume_duration_seconds.sample_count(&["created"]), 1);

        // The next delivery has nowhere to go, so the relay lets go of its source.
        let next = InboundMessage::new(Message::new("late"), "created", ctx.clone());
        sender.try_send(next).unwrap();
        timeout(PATIENT, sender.closed()).await.unwrap();
        assert_eq!(metrics.consumed_total.get(&["created"]), 2);
        assert_eq!(metrics.acks_total.get(&["created"]), 1);
    }

    #[tokio::test]
    async fn subscribe_failure_is_counted_and_returned() {
        let registry = registry();
        let metrics = Arc::new(SubscriberMetrics::register(&registry).unwrap());
        let subscriber = metrics.wrap(Arc::new(ScriptedSubscriber::default()));

        let err = subscriber
            .subscribe(&CallContext::new(), "created")
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::SubscribeFailed { topic, .. } if topic == "created"));
        assert_eq!(metrics.subscribe_errors_total.get(&["created"]), 1);
        assert_eq!(metrics.consumed_total.get(&["created"]), 0);
    }

    #[tokio::test]
    async fn close_error_is_propagated() {
        let registry = registry();
        let inner = Arc::new(ScriptedSubscriber::default());
        let subscriber = instrument_subscriber(Some(&registry), inner.clone()).unwrap();

        assert!(matches!(subscriber.close().await, Err(MessagingError::Closed)));
        assert_eq!(inner.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_registry_returns_the_same_subscriber() {
        let inner: Arc<dyn Subscriber> = Arc::new(ScriptedSubscriber::default());
        let subscriber = instrument_subscriber(None, Arc::clone(&inner)).unwrap();
        assert!(Arc::ptr_eq(&subscriber, &inner));
    }
}
