//! Send request payload, outcome and validation.
//!
//! Wire field names follow the JSON format callers already publish
//! (`uuid`, `subject_text`, `body_html`, ...).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::client::DeliveryError;

/// Hard cap on `to + cc + bcc` imposed by the delivery API.
pub const MAX_RECIPIENTS: usize = 50;

/// Outcome message for a delivered request.
pub const SUCCESS_MESSAGE: &str = "email queued successfully";

/// Why a request was not delivered.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("failed to decode send request: {0}")]
    Decode(String),

    #[error("invalid email uuid")]
    InvalidId,

    #[error("email recipient count is over {max}", max = MAX_RECIPIENTS)]
    TooManyRecipients { count: usize },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Decoded email send request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Caller-supplied idempotency token, must be a UUID
    #[serde(rename = "uuid", default)]
    pub id: String,

    /// Primary recipients
    #[serde(default)]
    pub to: Vec<String>,

    /// Carbon copy recipients
    #[serde(default)]
    pub cc: Vec<String>,

    /// Blind carbon copy recipients
    #[serde(default)]
    pub bcc: Vec<String>,

    /// Addresses for the Reply-To header
    #[serde(default)]
    pub reply_to_addresses: Vec<String>,

    #[serde(rename = "subject_text", default)]
    pub subject: String,

    #[serde(default)]
    pub body_html: String,

    /// Plain-text alternative for clients without HTML support
    #[serde(default)]
    pub body_text: Option<String>,
}

impl SendRequest {
    /// Decode a request from a raw message body.
    pub fn decode(body: &[u8]) -> Result<Self, MailError> {
        serde_json::from_slice(body).map_err(|e| MailError::Decode(e.to_string()))
    }

    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }

    /// Run every check in order: id, recipient cap, then fields.
    ///
    /// Returns the parsed id on success.
    pub fn validate(&self) -> Result<Uuid, MailError> {
        let id = self.parse_id()?;
        self.check_recipient_cap()?;
        self.validate_fields()?;
        Ok(id)
    }

    pub fn parse_id(&self) -> Result<Uuid, MailError> {
        Uuid::parse_str(self.id.trim()).map_err(|_| MailError::InvalidId)
    }

    pub fn check_recipient_cap(&self) -> Result<(), MailError> {
        let count = self.recipient_count();
        if count > MAX_RECIPIENTS {
            return Err(MailError::TooManyRecipients { count });
        }
        Ok(())
    }

    pub fn validate_fields(&self) -> Result<(), MailError> {
        if self.subject.trim().is_empty() {
            return Err(MailError::Validation("subject_text is required".into()));
        }
        if self.body_html.trim().is_empty() {
            return Err(MailError::Validation("body_html is required".into()));
        }
        if self.recipient_count() == 0 {
            return Err(MailError::Validation("at least one recipient is required".into()));
        }

        let fields = [
            ("to", &self.to),
            ("cc", &self.cc),
            ("bcc", &self.bcc),
            ("reply_to_addresses", &self.reply_to_addresses),
        ];
        for (field, addresses) in fields {
            if let Some((index, address)) = addresses
                .iter()
                .enumerate()
                .find(|(_, a)| !is_valid_address(a))
            {
                return Err(MailError::Validation(format!(
                    "{field}[{index}] is not a valid email address: '{address}'"
                )));
            }
        }

        Ok(())
    }

    /// Plain-text body, treating an empty string as absent.
    pub fn text_body(&self) -> Option<&str> {
        self.body_text.as_deref().filter(|t| !t.is_empty())
    }
}

/// Check that `raw` is a single bare mailbox such as `user@example.com`.
///
/// Display names (`Name <user@example.com>`) and groups are rejected, the
/// delivery API only accepts plain addresses.
pub fn is_valid_address(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return false;
    }

    let list = match mailparse::addrparse(trimmed) {
        Ok(list) => list,
        Err(_) => return false,
    };
    if list.len() != 1 {
        return false;
    }

    match &list[0] {
        mailparse::MailAddr::Single(info) if info.display_name.is_none() => {
            info.addr == trimmed && is_plain_mailbox(&info.addr)
        }
        _ => false,
    }
}

/// `local@domain` with a dot-atom local part and a hostname domain.
fn is_plain_mailbox(addr: &str) -> bool {
    let Some((local, domain)) = addr.split_once('@') else {
        return false;
    };

    let local_ok = local.split('.').all(|atom| {
        !atom.is_empty()
            && atom
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "!#$%&'*+/=?^_`{|}~-".contains(c))
    });

    let domain_ok = domain.split('.').all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });

    local_ok && domain_ok
}

/// Result reported back to request/response callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub success: bool,
    /// Fixed success phrase or the terminal error description
    pub message: String,
}

impl SendOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            message: SUCCESS_MESSAGE.to_string(),
        }
    }

    pub fn failure(error: &MailError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
        }
    }

    /// Value for the reply's `type` property.
    pub fn kind(&self) -> &'static str {
        if self.success {
            "success"
        } else {
            "error"
        }
    }
}
