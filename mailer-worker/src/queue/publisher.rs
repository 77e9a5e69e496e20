//! Reply publishing for request/response callers.
//!
//! The connector swaps the underlying channel on every reconnect, so the
//! publisher keeps the current channel behind a lock and publishes through
//! whatever is attached at the time of the call.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::error::QueueError;
use super::transport::LinkChannel;

/// A correlated response routed through the default exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Caller's reply queue, used as routing key
    pub routing_key: String,
    /// Message `type` property, `"success"` or `"error"`
    pub kind: String,
    /// Correlation id copied from the request
    pub correlation_id: String,
    /// JSON-encoded outcome
    pub body: Vec<u8>,
}

/// Publishes replies back onto the bus.
#[async_trait]
pub trait ReplyPublisher: Send + Sync {
    async fn publish_reply(&self, reply: Reply) -> Result<(), QueueError>;
}

/// Reply publisher bound to the connector's current channel.
#[derive(Default)]
pub struct SessionPublisher {
    channel: RwLock<Option<Arc<dyn LinkChannel>>>,
}

impl SessionPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route future replies through `channel`.
    pub async fn attach(&self, channel: Arc<dyn LinkChannel>) {
        *self.channel.write().await = Some(channel);
        debug!("reply_publisher_attached");
    }

    /// Drop the current channel; publishes fail until the next attach.
    pub async fn detach(&self) {
        if self.channel.write().await.take().is_some() {
            debug!("reply_publisher_detached");
        }
    }

    pub async fn is_attached(&self) -> bool {
        self.channel.read().await.is_some()
    }
}

#[async_trait]
impl ReplyPublisher for SessionPublisher {
    async fn publish_reply(&self, reply: Reply) -> Result<(), QueueError> {
        let channel = self
            .channel
            .read()
            .await
            .clone()
            .ok_or(QueueError::NotConnected)?;

        channel.publish(&reply).await?;

        info!(
            routing_key = %reply.routing_key,
            correlation_id = %reply.correlation_id,
            kind = %reply.kind,
            body_length = reply.body.len(),
            "rabbitmq_reply_published"
        );

        Ok(())
    }
}
