//! Connection lifecycle and reconnect loop.
//!
//! ```text
//! Disconnected → Connecting → Connected → (closed) → Disconnected
//!                    ↑  dial / channel / consume failure: wait, redial
//!                    └─ topology failure: fatal, run() returns Err
//! ```
//!
//! The connector is the sole owner of the physical link and the only
//! writer of [`ConnectionState`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::RmqConfig;

use super::consumer::{DeliveryHandler, Dispatcher};
use super::error::QueueError;
use super::publisher::SessionPublisher;
use super::transport::{ClosedNotify, Link, Topology, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A live, topology-ready connection.
struct Session {
    closed: ClosedNotify,
    dispatcher: JoinHandle<()>,
}

/// Why a session ended.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    /// Closure notifier went away without reporting an error
    Clean,
    Broken(QueueError),
    ConsumerStopped,
}

/// Keeps a consumer attached to the broker for the life of the process.
pub struct Connector {
    transport: Arc<dyn Transport>,
    topology: Topology,
    reconnect_wait: Duration,
    max_in_flight: Option<usize>,
    handler: Arc<dyn DeliveryHandler>,
    publisher: Arc<SessionPublisher>,
    link: Mutex<Option<Arc<dyn Link>>>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
}

impl Connector {
    pub fn new(
        config: &RmqConfig,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn DeliveryHandler>,
        publisher: Arc<SessionPublisher>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);

        Self {
            transport,
            topology: Topology {
                exchange: config.exchange.clone(),
                queue: config.queue.clone(),
                routing_key: config.routing_key.clone(),
                consumer_tag: config.consumer_tag.clone(),
                prefetch: config.prefetch,
            },
            reconnect_wait: config.reconnect_wait,
            max_in_flight: (config.worker_concurrency > 0).then_some(config.worker_concurrency),
            handler,
            publisher,
            link: Mutex::new(None),
            state,
            shutdown,
        }
    }

    /// Observe connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Run the reconnect loop.
    ///
    /// Returns `Ok(())` after [`Connector::stop`] or a clean closure, and
    /// `Err` only when the broker topology cannot be declared.
    pub async fn run(&self) -> Result<(), QueueError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u64 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            attempt += 1;
            self.state.send_replace(ConnectionState::Connecting);
            info!(attempt = attempt, "rabbitmq_connect_attempt");

            let session = match self.establish().await {
                Ok(session) => session,
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "rabbitmq_topology_failed");
                    self.state.send_replace(ConnectionState::Disconnected);
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        error = %e,
                        retry_in_ms = self.reconnect_wait.as_millis() as u64,
                        "rabbitmq_connect_failed"
                    );
                    self.state.send_replace(ConnectionState::Disconnected);

                    tokio::select! {
                        _ = sleep(self.reconnect_wait) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            attempt = 0;
            self.state.send_replace(ConnectionState::Connected);
            info!(
                exchange = %self.topology.exchange,
                queue = %self.topology.queue,
                "rabbitmq_ready"
            );

            let end = self.supervise(session, &mut shutdown).await;

            self.publisher.detach().await;
            self.release_link().await;
            self.state.send_replace(ConnectionState::Disconnected);

            match end {
                SessionEnd::Shutdown => {
                    info!("rabbitmq_connector_stopped");
                    return Ok(());
                }
                SessionEnd::Clean => {
                    info!("rabbitmq_connection_closed_cleanly");
                    return Ok(());
                }
                SessionEnd::Broken(e) => {
                    warn!(error = %e, "rabbitmq_connection_lost");
                }
                SessionEnd::ConsumerStopped => {
                    warn!("rabbitmq_consumer_stopped_unexpectedly");
                }
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        info!("rabbitmq_connector_stopped");
        Ok(())
    }

    /// Request shutdown and close the current link. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        info!("rabbitmq_closing_connections");
        self.release_link().await;
    }

    /// Dial, open a channel, declare topology and start consuming.
    async fn establish(&self) -> Result<Session, QueueError> {
        let link: Arc<dyn Link> = Arc::from(self.transport.dial().await?);

        let channel = match link.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_quietly(link.as_ref()).await;
                return Err(e);
            }
        };

        if let Err(e) = channel.declare_topology(&self.topology).await {
            close_quietly(link.as_ref()).await;
            return Err(match e {
                QueueError::Topology(_) => e,
                other => QueueError::Topology(other.to_string()),
            });
        }

        let closed = channel.closed();

        let stream = match channel.consume(&self.topology).await {
            Ok(stream) => stream,
            Err(e) => {
                close_quietly(link.as_ref()).await;
                return Err(e);
            }
        };

        self.publisher.attach(Arc::clone(&channel)).await;
        *self.link.lock().await = Some(link);

        let dispatcher = Dispatcher::new(Arc::clone(&self.handler), self.max_in_flight);
        let dispatcher = tokio::spawn(dispatcher.run(stream));

        Ok(Session { closed, dispatcher })
    }

    /// Block until the session ends for any reason.
    async fn supervise(
        &self,
        session: Session,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let Session {
            mut closed,
            mut dispatcher,
        } = session;

        let end = tokio::select! {
            biased;
            _ = shutdown.changed() => SessionEnd::Shutdown,
            notice = closed.recv() => match notice {
                Some(e) => SessionEnd::Broken(e),
                None => SessionEnd::Clean,
            },
            _ = &mut dispatcher => SessionEnd::ConsumerStopped,
        };

        // stop pulling new items; spawned handler tasks keep running
        dispatcher.abort();

        if *shutdown.borrow() {
            return SessionEnd::Shutdown;
        }
        end
    }

    async fn release_link(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            close_quietly(link.as_ref()).await;
        }
    }
}

async fn close_quietly(link: &dyn Link) {
    if let Err(e) = link.close().await {
        debug!(error = %e, "rabbitmq_connection_close_error");
    }
}
