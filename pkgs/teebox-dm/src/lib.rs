//! Teebox DM - types shared by the message store and the client sync engine
//!
//! Both sides of the direct-messaging pipeline speak the same request and
//! response shapes and classify failures with the same error codes. The
//! retry and timeout helpers live here too: the client send path retries
//! with them and the store bounds its request handlers with the timeout.
//!
//! - [`models`]: messages, conversation summaries, request/response payloads
//! - [`error`]: wire error codes and retryability
//! - [`retry`]: exponential backoff with a per-attempt deadline

pub mod error;
pub mod models;
pub mod retry;

pub use error::{ApiError, ErrorCode};
pub use models::*;
pub use retry::{with_retry, with_timeout, RetryConfig};

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
