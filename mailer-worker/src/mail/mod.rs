//! Email send pipeline.
//!
//! ## Processing Flow
//!
//! ```text
//! WorkItem body → SendRequest → validate → EmailInput → RetryingSender → DeliveryClient
//!                                                            ↑
//!                                                      RateLimiter (shared)
//! ```

pub mod client;
pub mod handler;
pub mod rate_limiter;
pub mod sender;
pub mod types;

pub use client::{DeliveryClient, DeliveryError, EmailInput, HttpDeliveryClient};
pub use handler::Mailer;
pub use rate_limiter::RateLimiter;
pub use sender::{RetryPolicy, RetryingSender};
pub use types::{MailError, SendOutcome, SendRequest, MAX_RECIPIENTS};
