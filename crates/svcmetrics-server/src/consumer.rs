use svcmetrics_common::CallContext;
use svcmetrics_messaging::{Result, Subscriber};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Subscribes to `topic` and acknowledges every delivered message. The task ends with the
/// subscription and yields the number of messages it handled.
pub async fn spawn(
    subscriber: &dyn Subscriber,
    ctx: &CallContext,
    topic: &str,
) -> Result<JoinHandle<u64>> {
    let mut stream = subscriber.subscribe(ctx, topic).await?;
    info!(topic, "consumer subscribed");

    let topic = topic.to_string();
    Ok(tokio::spawn(async move {
        let mut handled = 0;
        while let Some(message) = stream.recv().await {
            info!(
                topic = %topic,
                message_id = message.id(),
                bytes = message.payload().len(),
                "message received"
            );
            message.ack();
            handled += 1;
        }
        debug!(topic = %topic, handled, "consumer stopped");
        handled
    }))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use svcmetrics_messaging::{InMemoryBroker, Message, Publisher, instrument_subscriber};
    use svcmetrics_registry::{MetricRegistry, RegistryOptions};
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn acknowledges_until_cancelled() {
        let registry = MetricRegistry::with_options(
            "demo",
            RegistryOptions {
                include_runtime_metrics: false,
                ..RegistryOptions::default()
            },
        )
        .unwrap();
        let broker = Arc::new(InMemoryBroker::new());
        let subscriber = instrument_subscriber(Some(&registry), broker.clone()).unwrap();
        let root = CallContext::new();

        let consumer = spawn(subscriber.as_ref(), &root, "events").await.unwrap();
        for index in 0..3 {
            broker
                .publish(&root, "events", Message::new(format!("event-{index}")))
                .await
                .unwrap();
        }

        let export = registry.export();
        timeout(Duration::from_secs(2), async {
            while !export
                .render()
                .contains("demo_message_acks_total{topic=\"events\"} 3\n")
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        root.cancel();
        let handled = timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handled, 3);
    }
}
