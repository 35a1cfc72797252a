use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use svcmetrics_common::context::CallContext;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

pub type MessageStream = mpsc::Receiver<InboundMessage>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub payload: Bytes,
    pub metadata: HashMap<String, String>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload: payload.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    Nacked,
}

/// A delivered message plus its acknowledgment state.
///
/// Clones share the acknowledgment: whichever clone settles first wins, later `ack`/`nack`
/// calls return `false`.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    message: Arc<Message>,
    topic: Arc<str>,
    settlement: Arc<watch::Sender<Option<AckOutcome>>>,
    context: CallContext,
}

impl InboundMessage {
    pub fn new(message: Message, topic: &str, context: CallContext) -> Self {
        let (settlement, _) = watch::channel(None);
        Self {
            message: Arc::new(message),
            topic: Arc::from(topic),
            settlement: Arc::new(settlement),
            context,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Context of the subscription that delivered this message.
    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn ack(&self) -> bool {
        self.settle(AckOutcome::Acked)
    }

    pub fn nack(&self) -> bool {
        self.settle(AckOutcome::Nacked)
    }

    pub fn try_outcome(&self) -> Option<AckOutcome> {
        *self.settlement.borrow()
    }

    /// Resolves once the message is acked or nacked.
    pub async fn outcome(&self) -> AckOutcome {
        let mut receiver = self.settlement.subscribe();
        if let Ok(settled) = receiver.wait_for(Option::is_some).await
            && let Some(outcome) = *settled
        {
            return outcome;
        }
        // `self` holds the sender, so the channel stays open while this future exists.
        std::future::pending().await
    }

    fn settle(&self, outcome: AckOutcome) -> bool {
        self.settlement.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(outcome);
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn inbound() -> InboundMessage {
        InboundMessage::new(
            Message::new("payload").with_id("m-1").with_metadata("k", "v"),
            "orders",
            CallContext::new(),
        )
    }

    #[test]
    fn message_builders() {
        let message = Message::new(Bytes::from_static(b"x"));
        assert_eq!(message.id.len(), 36);
        assert!(message.metadata.is_empty());

        let inbound = inbound();
        assert_eq!(inbound.id(), "m-1");
        assert_eq!(inbound.topic(), "orders");
        assert_eq!(inbound.payload().as_ref(), b"payload");
        assert_eq!(inbound.message().metadata.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn first_settlement_wins() {
        let message = inbound();
        let clone = message.clone();

        assert_eq!(message.try_outcome(), None);
        assert!(clone.ack());
        assert!(!message.nack());
        assert!(!message.ack());
        assert_eq!(message.try_outcome(), Some(AckOutcome::Acked));
    }

    #[tokio::test]
    async fn outcome_waits_for_settlement() {
        let message = inbound();
        let observer = message.clone();
        let waiter = tokio::spawn(async move { observer.outcome().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        message.nack();
        assert_eq!(waiter.await.unwrap(), AckOutcome::Nacked);
    }

    #[tokio::test]
    async fn outcome_after_settlement_is_immediate() {
        let message = inbound();
        message.ack();
        assert_eq!(message.outcome().await, AckOutcome::Acked);
    }
}
