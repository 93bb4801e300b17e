//! Delivery-error taxonomy.
//!
//! The queue manager decides what to do with a failed push based on the
//! HTTP-style status the transport reports. Classification is pure so the
//! retry policy is testable without a network.

use serde::{Deserialize, Serialize};

/// How a delivery failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorClass {
    /// Network failure, request timeout, or 5xx. Retried with backoff.
    Transient,
    /// 409 conflict or 429 rate-limited. Retried, same backoff path.
    Retryable,
    /// Any other 4xx. Not retried; surfaced as a user-actionable error.
    Validation,
    /// Fatal, requires manual intervention. Not retried.
    Permanent,
}

impl ErrorClass {
    /// Classify an HTTP-style status. `None` means the request never got a
    /// response (connection failure or timeout).
    pub fn from_status(status: Option<u16>) -> Self {
        match status {
            None => ErrorClass::Transient,
            Some(408) => ErrorClass::Transient,
            Some(409) | Some(429) => ErrorClass::Retryable,
            Some(s) if (500..=599).contains(&s) => ErrorClass::Transient,
            Some(s) if (400..=499).contains(&s) => ErrorClass::Validation,
            Some(_) => ErrorClass::Permanent,
        }
    }

    /// Whether another delivery attempt is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Retryable)
    }
}
