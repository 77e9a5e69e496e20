//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - The transport seam and its lapin implementation
//! - The reconnecting connector and the consumer dispatcher
//! - Work item finalization and reply publishing
//!
//! ## Architecture
//!
//! ```text
//! Connector → Transport (dial, channel, topology) → Dispatcher → DeliveryHandler
//!                                                                    ↓
//!                                      WorkItem ack/reject + SessionPublisher reply
//! ```

pub mod connector;
pub mod consumer;
pub mod error;
pub mod publisher;
pub mod transport;
pub mod types;

pub use connector::{ConnectionState, Connector};
pub use consumer::{DeliveryHandler, Dispatcher};
pub use error::QueueError;
pub use publisher::{Reply, ReplyPublisher, SessionPublisher};
pub use transport::{AmqpTransport, Link, LinkChannel, Topology, Transport, WorkStream};
pub use types::{Acknowledger, ReplyTarget, WorkItem};
