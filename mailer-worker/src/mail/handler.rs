//! Request handling pipeline for one work item.
//!
//! ```text
//! decode → id → recipient cap → fields → send_with_retry → ack/reject → reply?
//! ```
//!
//! This is the only place that decides between acknowledge and reject, and
//! the only place replies are published from.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::config::MailConfig;
use crate::queue::{DeliveryHandler, Reply, ReplyPublisher, WorkItem};
use crate::telemetry::{SpanStatus, Telemetry};

use super::client::EmailInput;
use super::sender::RetryingSender;
use super::types::{MailError, SendOutcome, SendRequest};

/// Handles email send requests consumed from the queue.
pub struct Mailer {
    sender_address: String,
    sender: RetryingSender,
    publisher: Arc<dyn ReplyPublisher>,
    telemetry: Arc<dyn Telemetry>,
}

impl Mailer {
    pub fn new(
        config: &MailConfig,
        sender: RetryingSender,
        publisher: Arc<dyn ReplyPublisher>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            sender_address: config.sender.clone(),
            sender,
            publisher,
            telemetry,
        }
    }

    /// Validate and deliver one raw request body.
    pub async fn process(&self, body: &[u8]) -> Result<(), MailError> {
        let mut span = self.telemetry.span("mail", "send_email");

        let result = self.process_inner(body).await;
        match &result {
            Ok(()) => span.set_status(SpanStatus::Ok, "email sent"),
            Err(e) => span.fail(&e.to_string(), "failed to send email"),
        }

        result
    }

    async fn process_inner(&self, body: &[u8]) -> Result<(), MailError> {
        let request = SendRequest::decode(body)?;
        let id = request.validate()?;

        info!(
            mail_uuid = %id,
            recipients = request.recipient_count(),
            "mail_request_validated"
        );

        let input = EmailInput::from_request(&self.sender_address, &request);
        self.sender.send_with_retry(&input).await?;

        Ok(())
    }

    /// Finalize `item` according to `result` and reply when asked to.
    async fn finish(&self, item: WorkItem, result: Result<(), MailError>) {
        let mut span = self.telemetry.span("mail", "handle_mail_request_result");

        let outcome = match &result {
            Ok(()) => SendOutcome::success(),
            Err(e) => SendOutcome::failure(e),
        };

        let reply_target = item.reply_target.clone();
        let message_id = item.log_id().to_string();
        let delivery_tag = item.delivery_tag;

        let finalized = if outcome.success {
            span.set_status(SpanStatus::Ok, &outcome.message);
            item.acknowledge().await
        } else {
            span.fail(&outcome.message, "failed to queue email");
            item.reject().await
        };

        match finalized {
            Ok(()) => info!(
                message_id = %message_id,
                success = outcome.success,
                message = %outcome.message,
                "mail_request_finalized"
            ),
            Err(e) => {
                span.record_error(&e.to_string());
                error!(
                    message_id = %message_id,
                    delivery_tag = delivery_tag,
                    error = %e,
                    "rabbitmq_ack_failed"
                );
            }
        }

        let Some(target) = reply_target else {
            return;
        };

        let body = match serde_json::to_vec(&outcome) {
            Ok(body) => body,
            Err(e) => {
                span.fail(&e.to_string(), "failed to encode rpc response");
                return;
            }
        };

        let reply = Reply {
            routing_key: target.destination,
            kind: outcome.kind().to_string(),
            correlation_id: target.correlation_id,
            body,
        };

        if let Err(e) = self.publisher.publish_reply(reply).await {
            span.fail(&e.to_string(), "failed to publish rpc response");
            warn!(
                message_id = %message_id,
                error = %e,
                "rabbitmq_reply_failed"
            );
        }
    }
}

#[async_trait]
impl DeliveryHandler for Mailer {
    async fn handle(&self, item: WorkItem) {
        info!(
            message_id = %item.log_id(),
            delivery_tag = item.delivery_tag,
            body_length = item.body.len(),
            wants_reply = item.reply_target.is_some(),
            "mail_request_received"
        );

        let result = self.process(&item.body).await;
        if let Err(e) = &result {
            warn!(message_id = %item.log_id(), error = %e, "mail_request_failed");
        }

        self.finish(item, result).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::mail::client::{DeliveryError, MockDeliveryClient};
    use crate::mail::rate_limiter::RateLimiter;
    use crate::mail::sender::RetryPolicy;
    use crate::queue::types::testing::{Finalized, RecordingAcker};
    use crate::queue::{QueueError, ReplyTarget};
    use crate::telemetry::testing::RecordingTelemetry;
    use crate::telemetry::TracingTelemetry;

    #[derive(Default)]
    struct RecordingPublisher {
        fail: bool,
        replies: Mutex<Vec<Reply>>,
    }

    impl RecordingPublisher {
        fn replies(&self) -> Vec<Reply> {
            self.replies.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReplyPublisher for RecordingPublisher {
        async fn publish_reply(&self, reply: Reply) -> Result<(), QueueError> {
            self.replies.lock().unwrap().push(reply);
            if self.fail {
                return Err(QueueError::Publish("channel closed".into()));
            }
            Ok(())
        }
    }

    fn mail_config(max_retry_attempts: u32) -> MailConfig {
        MailConfig {
            sender: "noreply@x.com".to_string(),
            retry_wait: Duration::from_secs(1),
            max_retry_attempts,
            requests_per_second: 10,
        }
    }

    struct Harness {
        mailer: Mailer,
        publisher: Arc<RecordingPublisher>,
        limiter: Arc<RateLimiter>,
    }

    fn harness(client: MockDeliveryClient, max_retry_attempts: u32) -> Harness {
        harness_with(client, max_retry_attempts, RecordingPublisher::default(), Arc::new(TracingTelemetry))
    }

    fn harness_with(
        client: MockDeliveryClient,
        max_retry_attempts: u32,
        publisher: RecordingPublisher,
        telemetry: Arc<dyn Telemetry>,
    ) -> Harness {
        let config = mail_config(max_retry_attempts);
        let limiter = Arc::new(RateLimiter::per_second(config.requests_per_second));
        let sender = RetryingSender::new(
            Arc::new(client),
            Arc::clone(&limiter),
            RetryPolicy::from_config(&config),
            Arc::clone(&telemetry),
        );
        let publisher = Arc::new(publisher);
        let mailer = Mailer::new(&config, sender, publisher.clone(), telemetry);

        Harness {
            mailer,
            publisher,
            limiter,
        }
    }

    fn body(request: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&request).unwrap()
    }

    fn valid_body() -> Vec<u8> {
        body(serde_json::json!({
            "uuid": "7f1c1f1e-2b8a-4a0e-9a57-0c5a3e6f9d21",
            "to": ["a@x.com"],
            "subject_text": "Welcome",
            "body_html": "<p>Hello</p>"
        }))
    }

    fn rpc_target() -> Option<ReplyTarget> {
        ReplyTarget::from_properties(Some("rpc.reply"), Some("abc"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_acknowledges_without_reply() {
        let mut client = MockDeliveryClient::new();
        client.expect_send_email().times(1).returning(|_| Ok(()));
        let h = harness(client, 3);
        let acker = RecordingAcker::default();

        h.mailer
            .handle(WorkItem::new(valid_body(), None, acker.clone()))
            .await;

        assert_eq!(acker.calls(), vec![Finalized::Ack]);
        assert!(h.publisher.replies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_replies_when_requested() {
        let mut client = MockDeliveryClient::new();
        client.expect_send_email().times(1).returning(|_| Ok(()));
        let h = harness(client, 3);
        let acker = RecordingAcker::default();

        h.mailer
            .handle(WorkItem::new(valid_body(), rpc_target(), acker.clone()))
            .await;

        assert_eq!(acker.calls(), vec![Finalized::Ack]);
        let replies = h.publisher.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, "success");
        assert_eq!(replies[0].correlation_id, "abc");
        let outcome: SendOutcome = serde_json::from_slice(&replies[0].body).unwrap();
        assert_eq!(outcome, SendOutcome::success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_reject_and_reply_error() {
        let mut client = MockDeliveryClient::new();
        client
            .expect_send_email()
            .times(2)
            .returning(|_| Err(DeliveryError::Throttled));
        let h = harness(client, 2);
        let acker = RecordingAcker::default();

        h.mailer
            .handle(WorkItem::new(valid_body(), rpc_target(), acker.clone()))
            .await;

        assert_eq!(acker.calls(), vec![Finalized::Reject]);
        let replies = h.publisher.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].routing_key, "rpc.reply");
        assert_eq!(replies[0].correlation_id, "abc");
        assert_eq!(replies[0].kind, "error");
        let outcome: SendOutcome = serde_json::from_slice(&replies[0].body).unwrap();
        assert!(!outcome.success);
        assert_eq!(
            outcome.message,
            "delivery error: delivery API throttled the request"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_json_rejects_without_delivery_or_admission() {
        let mut client = MockDeliveryClient::new();
        client.expect_send_email().never();
        let h = harness(client, 3);
        let acker = RecordingAcker::default();

        h.mailer
            .handle(WorkItem::new(b"{\"uuid\": ".to_vec(), None, acker.clone()))
            .await;

        assert_eq!(acker.calls(), vec![Finalized::Reject]);

        // an untouched limiter admits immediately
        let start = Instant::now();
        h.limiter.acquire().await;
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_many_recipients_never_calls_client() {
        let mut client = MockDeliveryClient::new();
        client.expect_send_email().never();
        let h = harness(client, 3);
        let acker = RecordingAcker::default();

        let to: Vec<String> = (0..40).map(|i| format!("to{i}@x.com")).collect();
        let bcc: Vec<String> = (0..11).map(|i| format!("bcc{i}@x.com")).collect();
        let payload = body(serde_json::json!({
            "uuid": "7f1c1f1e-2b8a-4a0e-9a57-0c5a3e6f9d21",
            "to": to,
            "bcc": bcc,
            "subject_text": "Welcome",
            "body_html": "<p>Hello</p>"
        }));

        h.mailer
            .handle(WorkItem::new(payload, rpc_target(), acker.clone()))
            .await;

        assert_eq!(acker.calls(), vec![Finalized::Reject]);
        let outcome: SendOutcome =
            serde_json::from_slice(&h.publisher.replies()[0].body).unwrap();
        assert_eq!(outcome.message, "email recipient count is over 50");
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_ids_never_call_client() {
        for id in ["", "abc", "7f1c1f1e2b8a4a0e9a57", "not-a-uuid-at-all"] {
            let mut client = MockDeliveryClient::new();
            client.expect_send_email().never();
            let h = harness(client, 3);
            let acker = RecordingAcker::default();

            let payload = body(serde_json::json!({
                "uuid": id,
                "to": ["a@x.com"],
                "subject_text": "Welcome",
                "body_html": "<p>Hello</p>"
            }));
            h.mailer
                .handle(WorkItem::new(payload, rpc_target(), acker.clone()))
                .await;

            assert_eq!(acker.calls(), vec![Finalized::Reject], "id {id:?}");
            let outcome: SendOutcome =
                serde_json::from_slice(&h.publisher.replies()[0].body).unwrap();
            assert_eq!(outcome.message, "invalid email uuid");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_address_rejects() {
        let mut client = MockDeliveryClient::new();
        client.expect_send_email().never();
        let h = harness(client, 3);
        let acker = RecordingAcker::default();

        let payload = body(serde_json::json!({
            "uuid": "7f1c1f1e-2b8a-4a0e-9a57-0c5a3e6f9d21",
            "to": ["a@x.com", "nope"],
            "subject_text": "Welcome",
            "body_html": "<p>Hello</p>"
        }));
        h.mailer.handle(WorkItem::new(payload, None, acker.clone())).await;

        assert_eq!(acker.calls(), vec![Finalized::Reject]);
        assert!(h.publisher.replies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_reply_metadata_never_replies() {
        let mut client = MockDeliveryClient::new();
        client.expect_send_email().returning(|_| Ok(()));
        let h = harness(client, 3);

        for target in [
            ReplyTarget::from_properties(Some("rpc.reply"), None),
            ReplyTarget::from_properties(None, Some("abc")),
        ] {
            let acker = RecordingAcker::default();
            h.mailer
                .handle(WorkItem::new(valid_body(), target, acker.clone()))
                .await;
            assert_eq!(acker.calls(), vec![Finalized::Ack]);
        }

        assert!(h.publisher.replies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_failure_keeps_ack_decision() {
        let mut client = MockDeliveryClient::new();
        client.expect_send_email().times(1).returning(|_| Ok(()));
        let telemetry = RecordingTelemetry::default();
        let publisher = RecordingPublisher {
            fail: true,
            ..Default::default()
        };
        let h = harness_with(client, 3, publisher, Arc::new(telemetry.clone()));
        let acker = RecordingAcker::default();

        h.mailer
            .handle(WorkItem::new(valid_body(), rpc_target(), acker.clone()))
            .await;

        assert_eq!(acker.calls(), vec![Finalized::Ack]);
        assert_eq!(h.publisher.replies().len(), 1);

        let spans = telemetry.spans("handle_mail_request_result");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, SpanStatus::Error);
        assert_eq!(spans[0].status_message, "failed to publish rpc response");
    }
}
