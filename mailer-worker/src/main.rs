//! Mailer Worker - RabbitMQ consumer relaying send requests to the delivery API.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailer::{
    AmqpTransport, Config, Connector, HttpDeliveryClient, Mailer, RateLimiter, RetryPolicy,
    RetryingSender, SessionPublisher, Telemetry, TracingTelemetry,
};

const BUILD: &str = match option_env!("MAILER_BUILD") {
    Some(build) => build,
    None => "development",
};

const VERSION: &str = match option_env!("MAILER_VERSION") {
    Some(version) => version,
    None => "development",
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!(build = BUILD, version = VERSION, "worker_starting");

    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        queue = %config.rmq.queue,
        exchange = %config.rmq.exchange,
        requests_per_second = config.mail.requests_per_second,
        max_retry_attempts = config.mail.max_retry_attempts,
        worker_concurrency = config.rmq.worker_concurrency,
        delivery_token_set = config.delivery.token.is_some(),
        "config_loaded"
    );

    let telemetry: Arc<dyn Telemetry> = Arc::new(TracingTelemetry);
    let client = HttpDeliveryClient::new(&config.delivery)
        .context("failed to build delivery API client")?;
    let sender = RetryingSender::new(
        Arc::new(client),
        Arc::new(RateLimiter::per_second(config.mail.requests_per_second)),
        RetryPolicy::from_config(&config.mail),
        Arc::clone(&telemetry),
    );

    let publisher = Arc::new(SessionPublisher::new());
    let mailer = Mailer::new(&config.mail, sender, publisher.clone(), telemetry);

    let connector = Arc::new(Connector::new(
        &config.rmq,
        Arc::new(AmqpTransport::new(config.rmq.url.clone())),
        Arc::new(mailer),
        publisher,
    ));

    let mut worker = tokio::spawn({
        let connector = Arc::clone(&connector);
        async move { connector.run().await }
    });

    tokio::select! {
        _ = shutdown_signal() => {
            connector.stop().await;
            worker
                .await
                .context("connector task panicked")?
                .context("connector failed during shutdown")?;
        }
        finished = &mut worker => {
            finished
                .context("connector task panicked")?
                .context("connector stopped")?;
        }
    }

    info!("worker_stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received_sigint"),
        _ = terminate => info!("received_sigterm"),
    }
}
