//! Detection of provider-side rate limiting

use http::{HeaderMap, StatusCode};
use jiff::Timestamp;
use serde_json::Value;

/// Unix-seconds time at which the provider lifts the limit
pub const RESET_HEADER: &str = "anthropic-ratelimit-unified-reset";

/// Phrase the provider uses for account-level limits returned without a 429
const RATE_LIMIT_PHRASE: &str = "exceed your account's rate limit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSignal {
    /// Provider-supplied end of the limit, if it sent one
    pub reset_at: Option<Timestamp>,
}

/// Inspect an upstream response for a rate-limit signal
///
/// A 429 is always a rate limit; the reset header is only honored on a
/// 429. Any other response counts when `error.message` (or the whole body
/// when that field is absent) contains the provider's rate-limit phrase.
pub fn detect_rate_limit(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Option<RateLimitSignal> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let reset_at = headers
            .get(RESET_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .and_then(|seconds| Timestamp::from_second(seconds).ok());
        return Some(RateLimitSignal { reset_at });
    }

    if body.is_empty() {
        return None;
    }

    let text = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|value| value.pointer("/error/message").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());

    text.to_lowercase()
        .contains(RATE_LIMIT_PHRASE)
        .then_some(RateLimitSignal { reset_at: None })
}
