use async_trait::async_trait;
use svcmetrics_common::context::CallContext;

use crate::{
    error::Result,
    message::{Message, MessageStream},
};

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, ctx: &CallContext, topic: &str, message: Message) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Each delivered [`crate::InboundMessage`] is settled by the consumer with `ack()` or
/// `nack()`; the stream ends when the subscription does.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, ctx: &CallContext, topic: &str) -> Result<MessageStream>;

    async fn close(&self) -> Result<()>;
}
