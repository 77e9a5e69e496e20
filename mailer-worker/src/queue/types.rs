//! Inbound work items and their finalization handle.
//!
//! A [`WorkItem`] is produced by the transport for every message delivered
//! to the consumer. It must be finalized exactly once, either with
//! [`WorkItem::acknowledge`] or [`WorkItem::reject`]. Both take `self`, so a
//! second finalization does not compile.

use std::fmt;

use async_trait::async_trait;
use tracing::warn;

use super::error::QueueError;

/// Broker-side finalization of a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledge this delivery only (`multiple = false`).
    async fn ack(&self) -> Result<(), QueueError>;

    /// Reject this delivery without requeueing it.
    async fn reject(&self) -> Result<(), QueueError>;
}

#[async_trait]
impl Acknowledger for lapin::acker::Acker {
    async fn ack(&self) -> Result<(), QueueError> {
        lapin::acker::Acker::ack(self, lapin::options::BasicAckOptions { multiple: false })
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))
    }

    async fn reject(&self) -> Result<(), QueueError> {
        lapin::acker::Acker::reject(self, lapin::options::BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))
    }
}

/// Where the outcome of a request/response style item should be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    /// Routing key of the caller's reply queue
    pub destination: String,
    /// Caller-supplied token echoed back on the reply
    pub correlation_id: String,
}

impl ReplyTarget {
    /// Build a reply target from the inbound message properties.
    ///
    /// Returns `None` unless both values are present and non-empty.
    pub fn from_properties(reply_to: Option<&str>, correlation_id: Option<&str>) -> Option<Self> {
        match (reply_to, correlation_id) {
            (Some(to), Some(id)) if !to.is_empty() && !id.is_empty() => Some(Self {
                destination: to.to_string(),
                correlation_id: id.to_string(),
            }),
            _ => None,
        }
    }
}

/// One inbound unit of work.
pub struct WorkItem {
    /// Raw message payload
    pub body: Vec<u8>,
    /// Reply routing, present only for request/response callers
    pub reply_target: Option<ReplyTarget>,
    /// Broker delivery tag, for logging
    pub delivery_tag: u64,
    /// AMQP message id, for logging
    pub message_id: Option<String>,
    acker: Option<Box<dyn Acknowledger>>,
}

impl WorkItem {
    pub fn new(
        body: Vec<u8>,
        reply_target: Option<ReplyTarget>,
        acker: impl Acknowledger + 'static,
    ) -> Self {
        Self {
            body,
            reply_target,
            delivery_tag: 0,
            message_id: None,
            acker: Some(Box::new(acker)),
        }
    }

    pub fn with_delivery_tag(mut self, delivery_tag: u64) -> Self {
        self.delivery_tag = delivery_tag;
        self
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    /// Message id for log lines, `"unknown"` when the publisher set none.
    pub fn log_id(&self) -> &str {
        self.message_id.as_deref().unwrap_or("unknown")
    }

    /// Acknowledge the item, relinquishing it.
    pub async fn acknowledge(mut self) -> Result<(), QueueError> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Err(QueueError::Ack("work item already finalized".into())),
        }
    }

    /// Reject the item without requeue, relinquishing it.
    pub async fn reject(mut self) -> Result<(), QueueError> {
        match self.acker.take() {
            Some(acker) => acker.reject().await,
            None => Err(QueueError::Ack("work item already finalized".into())),
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("body_length", &self.body.len())
            .field("reply_target", &self.reply_target)
            .field("delivery_tag", &self.delivery_tag)
            .field("message_id", &self.message_id)
            .field("finalized", &self.acker.is_none())
            .finish()
    }
}

impl Drop for WorkItem {
    fn drop(&mut self) {
        if self.acker.is_some() {
            warn!(
                delivery_tag = self.delivery_tag,
                message_id = %self.log_id(),
                "work_item_dropped_unfinalized"
            );
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Finalized, RecordingAcker};
    use super::*;

    #[test]
    fn test_reply_target_requires_both_fields() {
        assert_eq!(
            ReplyTarget::from_properties(Some("rpc.reply"), Some("abc")),
            Some(ReplyTarget {
                destination: "rpc.reply".to_string(),
                correlation_id: "abc".to_string(),
            })
        );
        assert_eq!(ReplyTarget::from_properties(Some("rpc.reply"), None), None);
        assert_eq!(ReplyTarget::from_properties(None, Some("abc")), None);
        assert_eq!(ReplyTarget::from_properties(Some(""), Some("abc")), None);
        assert_eq!(ReplyTarget::from_properties(Some("rpc.reply"), Some("")), None);
    }

    #[tokio::test]
    async fn test_acknowledge_records_single_ack() {
        let acker = RecordingAcker::default();
        let item = WorkItem::new(b"{}".to_vec(), None, acker.clone());

        item.acknowledge().await.unwrap();

        assert_eq!(acker.calls(), vec![Finalized::Ack]);
    }

    #[tokio::test]
    async fn test_reject_records_single_reject() {
        let acker = RecordingAcker::default();
        let item = WorkItem::new(b"{}".to_vec(), None, acker.clone()).with_delivery_tag(7);

        item.reject().await.unwrap();

        assert_eq!(acker.calls(), vec![Finalized::Reject]);
    }

    #[test]
    fn test_log_id_defaults_to_unknown() {
        let item = WorkItem::new(Vec::new(), None, RecordingAcker::default());
        assert_eq!(item.log_id(), "unknown");

        let item = item.with_message_id(Some("msg-1".into()));
        assert_eq!(item.log_id(), "msg-1");
        // finalize so the drop warning does not fire
        futures::executor::block_on(item.acknowledge()).unwrap();
    }
}
