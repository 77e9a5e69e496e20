//! Mailer - durable-queue email relay.
//!
//! Consumes send requests from RabbitMQ, validates them and hands each one
//! to an email delivery API under a global rate limit, then acks or rejects
//! the request and optionally publishes a correlated reply.
//!
//! ## Architecture
//!
//! ```text
//! exchange → queue → Connector → Dispatcher → Mailer → RetryingSender → delivery API
//!                                               └──────→ reply (correlation id)
//! ```

pub mod config;
pub mod mail;
pub mod queue;
pub mod telemetry;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use mail::{HttpDeliveryClient, Mailer, RateLimiter, RetryPolicy, RetryingSender};
pub use queue::{AmqpTransport, Connector, SessionPublisher};
pub use telemetry::{Telemetry, TracingTelemetry};
