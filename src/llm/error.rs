//! Chat completion errors and the retry policy applied to them.

use std::time::Duration;
use thiserror::Error;

/// Classification of a failed completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// 429
    RateLimited,
    /// 5xx
    ServerError,
    /// Other 4xx: bad request, auth, unknown model
    ClientError,
    /// Connection refused, reset or timed out
    NetworkError,
    /// The provider answered with something that is not a completion
    ParseError,
}

impl LlmErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited | LlmErrorKind::ServerError | LlmErrorKind::NetworkError
        )
    }

    fn base_delay(&self) -> Duration {
        match self {
            LlmErrorKind::RateLimited => Duration::from_secs(5),
            LlmErrorKind::ServerError => Duration::from_secs(2),
            _ => Duration::from_secs(1),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            LlmErrorKind::RateLimited => "rate limited",
            LlmErrorKind::ServerError => "server error",
            LlmErrorKind::ClientError => "client error",
            LlmErrorKind::NetworkError => "network error",
            LlmErrorKind::ParseError => "malformed response",
        }
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Error from a chat completion request.
#[derive(Debug, Error)]
#[error("{kind}{}: {message}", .status_code.map(|c| format!(" (HTTP {})", c)).unwrap_or_default())]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    /// Delay requested by the provider through `Retry-After`.
    pub retry_after: Option<Duration>,
}

impl LlmError {
    pub fn from_status(status_code: u16, body: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: classify_http_status(status_code),
            status_code: Some(status_code),
            message: body.into(),
            retry_after,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::NetworkError,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::ParseError,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Delay before retry `attempt` (0-based): the provider's hint if it gave
    /// one, otherwise exponential backoff from the kind's base delay, capped at
    /// one minute.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if let Some(retry_after) = self.retry_after {
            return retry_after;
        }
        let secs = self
            .kind
            .base_delay()
            .as_secs()
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_secs(secs.min(60))
    }
}

/// Bounds on transport-level retries of a single completion.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub max_elapsed: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_elapsed: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    /// A config that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            max_elapsed: Duration::ZERO,
        }
    }

    pub fn should_retry(&self, error: &LlmError, attempt: u32) -> bool {
        error.kind.is_transient() && attempt < self.max_attempts
    }
}

pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert_eq!(classify_http_status(429), LlmErrorKind::RateLimited);
        assert_eq!(classify_http_status(503), LlmErrorKind::ServerError);
        assert_eq!(classify_http_status(401), LlmErrorKind::ClientError);
        assert_eq!(classify_http_status(404), LlmErrorKind::ClientError);
    }

    #[test]
    fn test_only_transient_errors_retry() {
        let retry = RetryConfig::default();
        assert!(retry.should_retry(&LlmError::from_status(502, "bad gateway", None), 0));
        assert!(retry.should_retry(&LlmError::network("reset"), 2));
        assert!(!retry.should_retry(&LlmError::network("reset"), 3));
        assert!(!retry.should_retry(&LlmError::from_status(400, "bad request", None), 0));
        assert!(!retry.should_retry(&LlmError::parse("not json"), 0));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let error = LlmError::from_status(500, "oops", None);
        assert!(error.backoff(1) > error.backoff(0));
        assert_eq!(error.backoff(10), Duration::from_secs(60));

        let hinted = LlmError::from_status(429, "slow down", Some(Duration::from_secs(9)));
        assert_eq!(hinted.backoff(4), Duration::from_secs(9));
    }

    #[test]
    fn test_display_includes_status() {
        let error = LlmError::from_status(429, "slow down", None);
        assert_eq!(error.to_string(), "rate limited (HTTP 429): slow down");
        assert_eq!(LlmError::network("reset").to_string(), "network error: reset");
    }
}
