//! Bounded retry around a single delivery API call.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::MailConfig;
use crate::telemetry::{SpanStatus, Telemetry};

use super::client::{DeliveryClient, DeliveryError, EmailInput};
use super::rate_limiter::RateLimiter;

/// Retry bound and fixed backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total calls allowed per request, 0 behaves as 1
    pub max_attempts: u32,
    /// Pause between two attempts
    pub wait: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &MailConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            wait: config.retry_wait,
        }
    }
}

/// Sends one email through the shared limiter, retrying failed calls.
pub struct RetryingSender {
    client: Arc<dyn DeliveryClient>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    telemetry: Arc<dyn Telemetry>,
}

impl RetryingSender {
    pub fn new(
        client: Arc<dyn DeliveryClient>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            client,
            limiter,
            policy,
            telemetry,
        }
    }

    /// Deliver `input`, making at most `max_attempts` calls.
    ///
    /// Attempts run strictly one after another. Every attempt waits for the
    /// limiter first; the last error is returned once the bound is reached.
    pub async fn send_with_retry(&self, input: &EmailInput) -> Result<(), DeliveryError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let mut span = self.telemetry.span("mail", "send_with_retry");
            span.set_attribute("recipient", input.first_recipient().to_string());
            span.set_attribute("subject", input.message.subject.data.clone());
            span.set_attribute("attempt", attempt.to_string());

            self.limiter.acquire().await;

            let error = match self.client.send_email(input).await {
                Ok(()) => {
                    span.set_status(SpanStatus::Ok, "email sent successfully");
                    info!(
                        recipient = %input.first_recipient(),
                        attempt = attempt,
                        "mail_send_succeeded"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            if attempt >= max_attempts {
                span.fail(
                    &error.to_string(),
                    &format!("max retry attempts of {max_attempts} reached"),
                );
                warn!(
                    recipient = %input.first_recipient(),
                    attempt = attempt,
                    max_attempts = max_attempts,
                    error = %error,
                    "mail_send_exhausted"
                );
                return Err(error);
            }

            span.record_error(&error.to_string());
            warn!(
                recipient = %input.first_recipient(),
                attempt = attempt,
                retry_in_ms = self.policy.wait.as_millis() as u64,
                error = %error,
                "mail_send_retrying"
            );
            drop(span);

            sleep(self.policy.wait).await;
            attempt += 1;
        }
    }
}
