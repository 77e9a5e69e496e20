//! Broker transport seam and its lapin implementation.
//!
//! The connector only talks to the traits in this module, which keeps the
//! reconnect state machine independent of a live broker.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::error::QueueError;
use super::publisher::Reply;
use super::types::{ReplyTarget, WorkItem};

/// Stream of inbound work items for one channel.
pub type WorkStream = BoxStream<'static, Result<WorkItem, QueueError>>;

/// Receiver of involuntary closure notifications.
///
/// Yields `Some(err)` when the connection or channel broke. Yields `None`
/// once every notifier is gone, which only happens on a clean close.
pub type ClosedNotify = mpsc::UnboundedReceiver<QueueError>;

/// Broker-side names the worker depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Durable topic exchange requests are published to
    pub exchange: String,
    /// Durable queue the worker consumes from
    pub queue: String,
    /// Binding key between exchange and queue
    pub routing_key: String,
    /// Consumer tag announced to the broker
    pub consumer_tag: String,
    /// Unacked deliveries the broker may push ahead
    pub prefetch: u16,
}

/// Dials physical connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn dial(&self) -> Result<Box<dyn Link>, QueueError>;
}

/// One physical connection.
#[async_trait]
pub trait Link: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn LinkChannel>, QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

/// A channel on a [`Link`].
#[async_trait]
pub trait LinkChannel: Send + Sync {
    /// Declare exchange, queue and binding.
    async fn declare_topology(&self, topology: &Topology) -> Result<(), QueueError>;

    /// Register for closure notifications of this channel and its connection.
    fn closed(&self) -> ClosedNotify;

    /// Start consuming the topology's queue.
    async fn consume(&self, topology: &Topology) -> Result<WorkStream, QueueError>;

    /// Publish a reply on the default exchange.
    async fn publish(&self, reply: &Reply) -> Result<(), QueueError>;
}

// =============================================================================
// AMQP (lapin)
// =============================================================================

/// RabbitMQ transport.
pub struct AmqpTransport {
    url: String,
}

impl AmqpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn dial(&self) -> Result<Box<dyn Link>, QueueError> {
        info!(url_length = self.url.len(), "rabbitmq_connecting");

        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;

        info!("rabbitmq_connected");

        Ok(Box::new(AmqpLink {
            connection: Arc::new(connection),
        }))
    }
}

struct AmqpLink {
    connection: Arc<Connection>,
}

#[async_trait]
impl Link for AmqpLink {
    async fn open_channel(&self) -> Result<Arc<dyn LinkChannel>, QueueError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Channel(e.to_string()))?;

        info!(channel_id = channel.id(), "rabbitmq_channel_created");

        Ok(Arc::new(AmqpChannel {
            connection: Arc::clone(&self.connection),
            channel,
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| QueueError::Closed(e.to_string()))
    }
}

struct AmqpChannel {
    connection: Arc<Connection>,
    channel: Channel,
}

#[async_trait]
impl LinkChannel for AmqpChannel {
    async fn declare_topology(&self, topology: &Topology) -> Result<(), QueueError> {
        self.channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Topology(format!("exchange {}: {e}", topology.exchange)))?;

        self.channel
            .queue_declare(
                &topology.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Topology(format!("queue {}: {e}", topology.queue)))?;

        self.channel
            .queue_bind(
                &topology.queue,
                &topology.exchange,
                &topology.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Topology(format!("binding {}: {e}", topology.routing_key)))?;

        info!(
            exchange = %topology.exchange,
            queue = %topology.queue,
            routing_key = %topology.routing_key,
            "rabbitmq_topology_declared"
        );

        Ok(())
    }

    fn closed(&self) -> ClosedNotify {
        let (tx, rx) = mpsc::unbounded_channel();

        let conn_tx = tx.clone();
        self.connection.on_error(move |e| {
            let _ = conn_tx.send(QueueError::Closed(e.to_string()));
        });
        self.channel.on_error(move |e| {
            let _ = tx.send(QueueError::Closed(e.to_string()));
        });

        rx
    }

    async fn consume(&self, topology: &Topology) -> Result<WorkStream, QueueError> {
        self.channel
            .basic_qos(topology.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Consume(e.to_string()))?;

        info!(prefetch_count = topology.prefetch, "rabbitmq_qos_set");

        let consumer = self
            .channel
            .basic_consume(
                &topology.queue,
                &topology.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Consume(e.to_string()))?;

        info!(queue = %topology.queue, "rabbitmq_consumer_started");

        let stream = consumer.map(|delivery| {
            let delivery = delivery.map_err(|e| QueueError::Consume(e.to_string()))?;

            let reply_target = ReplyTarget::from_properties(
                delivery.properties.reply_to().as_ref().map(|s| s.as_str()),
                delivery.properties.correlation_id().as_ref().map(|s| s.as_str()),
            );
            let message_id = delivery
                .properties
                .message_id()
                .as_ref()
                .map(|s| s.to_string());

            Ok(WorkItem::new(delivery.data, reply_target, delivery.acker)
                .with_delivery_tag(delivery.delivery_tag)
                .with_message_id(message_id))
        });

        Ok(stream.boxed())
    }

    async fn publish(&self, reply: &Reply) -> Result<(), QueueError> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                &reply.routing_key,
                BasicPublishOptions::default(),
                &reply.body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_type(reply.kind.clone().into())
                    .with_correlation_id(reply.correlation_id.clone().into()),
            )
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?;

        if let Err(e) = confirm.await {
            warn!(error = %e, routing_key = %reply.routing_key, "rabbitmq_publish_confirm_failed");
            return Err(QueueError::Publish(e.to_string()));
        }

        Ok(())
    }
}
