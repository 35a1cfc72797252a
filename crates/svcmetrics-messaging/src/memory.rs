use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use svcmetrics_common::context::CallContext;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{MessagingError, Result},
    message::{InboundMessage, Message, MessageStream},
    traits::{Publisher, Subscriber},
};

const DEFAULT_BUFFER: usize = 64;

/// Process-local broker: every live subscription on a topic gets its own copy of each
/// published message. Publishing to a topic without subscribers drops the message.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

struct Subscription {
    id: u64,
    sender: mpsc::Sender<InboundMessage>,
    context: CallContext,
}

struct BrokerState {
    topics: RwLock<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
    buffer: usize,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    /// `buffer` is the per-subscription queue length; publishers wait when it is full.
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            state: Arc::new(BrokerState {
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                buffer: buffer.max(1),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn subscription_count(&self, topic: &str) -> usize {
        self.state
            .topics
            .read()
            .map(|topics| topics.get(topic).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed);
        }
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerState {
    fn targets(&self, topic: &str) -> Result<Vec<(mpsc::Sender<InboundMessage>, CallContext)>> {
        let topics = self.topics.read().map_err(|_| poisoned())?;

        Ok(topics
            .get(topic)
            .map(|subscriptions| {
                subscriptions
                    .iter()
                    .filter(|subscription| {
                        !subscription.context.is_cancelled() && !subscription.sender.is_closed()
                    })
                    .map(|subscription| {
                        (subscription.sender.clone(), subscription.context.clone())
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn remove(&self, topic: &str, id: u64) {
        if let Ok(mut topics) = self.topics.write()
            && let Some(subscriptions) = topics.get_mut(topic)
        {
            subscriptions.retain(|subscription| subscription.id != id);
            if subscriptions.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

fn poisoned() -> MessagingError {
    MessagingError::InternalError("broker topic lock poisoned".to_string())
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, ctx: &CallContext, topic: &str, message: Message) -> Result<()> {
        self.ensure_open()?;

        for (sender, context) in self.state.targets(topic)? {
            let inbound = InboundMessage::new(message.clone(), topic, context);
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    debug!(topic, "publish cancelled while a subscription queue was full");
                    return Err(MessagingError::Cancelled {
                        topic: topic.to_string(),
                    });
                }
                sent = sender.send(inbound) => {
                    if sent.is_err() {
                        debug!(topic, "subscriber went away during publish");
                    }
                }
            }
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Subscriber::close(self).await
    }
}

#[async_trait]
impl Subscriber for InMemoryBroker {
    async fn subscribe(&self, ctx: &CallContext, topic: &str) -> Result<MessageStream> {
        self.ensure_open()?;

        let (sender, stream) = mpsc::channel(self.state.buffer);
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut topics = self.state.topics.write().map_err(|_| poisoned())?;
            topics.entry(topic.to_string()).or_default().push(Subscription {
                id,
                sender: sender.clone(),
                context: ctx.clone(),
            });
        }

        // Dropping the last sender ends the subscriber's stream, so this task holds its clone
        // only until the subscription is removed.
        let state = Arc::clone(&self.state);
        let ctx = ctx.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = ctx.cancelled() => {}
                _ = state.shutdown.cancelled() => {}
                _ = sender.closed() => debug!(topic = %topic, "subscription stream dropped"),
            }
            drop(sender);
            state.remove(&topic, id);
        });

        Ok(stream)
    }

    async fn close(&self) -> Result<()> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.state.shutdown.cancel();
        if let Ok(mut topics) = self.state.topics.write() {
            topics.clear();
        }
        Ok(())
    }
}
