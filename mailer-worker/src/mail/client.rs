//! Delivery API client.
//!
//! [`DeliveryClient`] is the capability the retrying sender calls; the
//! production implementation posts the email as JSON to the configured
//! HTTP endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DeliveryApiConfig;

use super::types::SendRequest;

/// Charset declared on every subject and body part.
pub const CHARSET: &str = "UTF-8";

/// Tag name carrying the request id for traceability.
pub const ID_TAG: &str = "mail_uuid";

/// Failure reported by the delivery API.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery API throttled the request")]
    Throttled,

    #[error("delivery API rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("delivery API request failed: {0}")]
    Transport(String),
}

/// Text content with its charset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Content {
    pub data: String,
    pub charset: &'static str,
}

impl Content {
    pub fn utf8(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            charset: CHARSET,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Destination {
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub bcc_addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Body {
    pub html: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<Content>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub subject: Content,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageTag {
    pub name: String,
    pub value: String,
}

/// One email as accepted by the delivery API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailInput {
    /// Sender address
    pub source: String,
    pub reply_to_addresses: Vec<String>,
    pub destination: Destination,
    pub message: Message,
    pub tags: Vec<MessageTag>,
}

impl EmailInput {
    /// Map a validated request onto the delivery API shape.
    pub fn from_request(sender: &str, request: &SendRequest) -> Self {
        Self {
            source: sender.to_string(),
            reply_to_addresses: request.reply_to_addresses.clone(),
            destination: Destination {
                to_addresses: request.to.clone(),
                cc_addresses: request.cc.clone(),
                bcc_addresses: request.bcc.clone(),
            },
            message: Message {
                subject: Content::utf8(request.subject.as_str()),
                body: Body {
                    html: Content::utf8(request.body_html.as_str()),
                    text: request.text_body().map(Content::utf8),
                },
            },
            tags: vec![MessageTag {
                name: ID_TAG.to_string(),
                value: request.id.trim().to_string(),
            }],
        }
    }

    /// First addressee, for logging.
    pub fn first_recipient(&self) -> &str {
        let d = &self.destination;
        d.to_addresses
            .first()
            .or_else(|| d.cc_addresses.first())
            .or_else(|| d.bcc_addresses.first())
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Capability that actually sends an email.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn send_email(&self, input: &EmailInput) -> Result<(), DeliveryError>;
}

/// Delivery API client speaking JSON over HTTP.
pub struct HttpDeliveryClient {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpDeliveryClient {
    pub fn new(config: &DeliveryApiConfig) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .pool_max_idle_per_host(16)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.url.clone(),
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn send_email(&self, input: &EmailInput) -> Result<(), DeliveryError> {
        let mut request = self.client.post(&self.endpoint).json(input);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        debug!(endpoint = %self.endpoint, "delivery_api_request_starting");

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                warn!(endpoint = %self.endpoint, error = %e, "delivery_api_timeout");
            }
            DeliveryError::Transport(e.to_string())
        })?;

        let status = response.status();
        if status.is_success() {
            info!(status_code = status.as_u16(), "delivery_api_accepted");
            return Ok(());
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("delivery_api_throttled");
            return Err(DeliveryError::Throttled);
        }

        let body = response.text().await.unwrap_or_default();
        let preview: String = body.chars().take(200).collect();
        warn!(
            status_code = status.as_u16(),
            body_preview = %preview,
            "delivery_api_rejected"
        );

        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
