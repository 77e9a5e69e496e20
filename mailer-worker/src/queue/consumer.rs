//! Consumer dispatch.
//!
//! Pulls work items off a channel's consumer stream and spawns one task per
//! item, so a slow delivery never holds up the ones behind it. Admission
//! control lives in the mail rate limiter; the optional in-flight bound here
//! only caps the number of live tasks.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use super::transport::WorkStream;
use super::types::WorkItem;

/// Processes one work item. Must finalize it before returning.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, item: WorkItem);
}

/// Fans consumed work items out to concurrent handler tasks.
pub struct Dispatcher {
    handler: Arc<dyn DeliveryHandler>,
    limit: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    /// `max_in_flight` of `None` leaves concurrency unbounded.
    pub fn new(handler: Arc<dyn DeliveryHandler>, max_in_flight: Option<usize>) -> Self {
        Self {
            handler,
            limit: max_in_flight
                .filter(|n| *n > 0)
                .map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    /// Dispatch until `stream` ends.
    ///
    /// The stream ends when the channel it belongs to is torn down.
    pub async fn run(self, mut stream: WorkStream) {
        info!(
            max_in_flight = ?self.limit.as_ref().map(|s| s.available_permits()),
            "dispatcher_started"
        );

        let mut dispatched: u64 = 0;

        while let Some(next) = stream.next().await {
            let item = match next {
                Ok(item) => item,
                Err(e) => {
                    error!(error = %e, "rabbitmq_delivery_error");
                    continue;
                }
            };

            info!(
                message_id = %item.log_id(),
                delivery_tag = item.delivery_tag,
                "rabbitmq_job_received"
            );

            let permit = match &self.limit {
                Some(limit) => match Arc::clone(limit).acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        warn!("dispatcher_limit_closed");
                        None
                    }
                },
                None => None,
            };

            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                handler.handle(item).await;
                drop(permit);
            });

            dispatched += 1;
        }

        warn!(dispatched = dispatched, "rabbitmq_consumer_closed");
    }
}
