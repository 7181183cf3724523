//! Failure classification and rate-limit resume times
//!
//! The collection and consumption loops never sleep or retry in place. Every
//! failure is turned into a scheduling decision instead:
//!
//! - [`FailureClass::RateLimited`]: wait until the server's reset time plus a
//!   safety margin ([`resume_time`])
//! - [`FailureClass::TokenDesync`]: the server rejected the token while another
//!   instance is presumably refreshing it; retry on the next wake
//! - [`FailureClass::Transient`]: no response was received; retry on the next wake
//! - [`FailureClass::Permanent`]: any other API error with a response
//!
//! # Example
//!
//! ```
//! use mass_blocker::retry::{IsRetryable, classify, FailureClass};
//! use mass_blocker::Error;
//!
//! let err = Error::Transport("connection reset".into());
//! assert_eq!(classify(&err), FailureClass::Transient);
//! assert!(err.is_retryable());
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::RateLimitConfig;
use crate::error::Error;

/// Header carrying the number of calls left in the current window
pub const RATE_LIMIT_REMAINING: &str = "x-rate-limit-remaining";

/// Header carrying the window reset time, epoch seconds
pub const RATE_LIMIT_RESET: &str = "x-rate-limit-reset";

/// `error_description` the token endpoint returns for a token another client already rotated
pub const TOKEN_INVALID_DESCRIPTION: &str = "Value passed for the token was invalid.";

/// Trait for errors that can be classified as retryable or not
///
/// Rate limits, token desyncs and failures without a response should return `true`.
/// API errors that carry a response should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the work should be attempted again later
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        classify(self) != FailureClass::Permanent
    }
}

/// How a failed call should be handled by the loops
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// HTTP 429; resume after the server's reset time
    RateLimited,
    /// The server reported the token invalid; retry later without failing the item
    TokenDesync,
    /// An API error with a response; fail the item
    Permanent,
    /// No response received; retry on the next wake
    Transient,
}

/// Classify an error returned by the request layer
pub fn classify(error: &Error) -> FailureClass {
    match error {
        Error::Api(failure) if failure.status == 429 => FailureClass::RateLimited,
        Error::Api(failure) if failure.status == 400 && is_token_invalid(&failure.body) => {
            FailureClass::TokenDesync
        }
        Error::Api(_) => FailureClass::Permanent,
        // Everything else never produced a response
        _ => FailureClass::Transient,
    }
}

fn is_token_invalid(body: &Value) -> bool {
    body.get("error_description").and_then(Value::as_str) == Some(TOKEN_INVALID_DESCRIPTION)
}

/// Parse a reset header (epoch seconds)
pub fn parse_reset(value: Option<&str>) -> Option<DateTime<Utc>> {
    let seconds: i64 = value?.trim().parse().ok()?;
    DateTime::from_timestamp(seconds, 0)
}

/// Whether a successful response reports an exhausted quota
///
/// Exhaustion needs both a remaining count of zero and a reset header.
pub fn quota_exhausted(remaining: Option<&str>, reset: Option<&str>) -> bool {
    remaining.map(str::trim) == Some("0") && reset.is_some()
}

/// When work blocked by a rate limit may resume
///
/// The result is the reset time plus the safety margin, and never earlier than
/// `observed` plus the margin, so a clock skewed or stale reset still moves
/// forward. Without a reset time the configured fallback wait is used.
pub fn resume_time(
    config: &RateLimitConfig,
    reset: Option<DateTime<Utc>>,
    observed: DateTime<Utc>,
) -> DateTime<Utc> {
    let margin = chrono::Duration::from_std(config.safety_margin)
        .unwrap_or_else(|_| chrono::Duration::seconds(1));
    match reset {
        Some(reset) => reset.max(observed) + margin,
        None => {
            tracing::warn!("rate limited without a reset time, using fallback wait");
            let wait = chrono::Duration::from_std(config.missing_reset_wait)
                .unwrap_or_else(|_| chrono::Duration::minutes(15));
            observed + wait.max(margin)
        }
    }
}
