use thiserror::Error;

/// Substrings that mark a provider failure as retryable.
///
/// The mapping is intentionally conservative: rate limiting, upstream
/// gateway failures and connection-level problems retry; everything else
/// (auth, validation, quota exhaustion) surfaces immediately.
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "temporarily unavailable",
    "rate limit",
    "too many requests",
    "connection reset",
    "connection error",
    "408",
    "429",
    "502",
    "503",
    "504",
];

/// Provider failure, classified for the core's retry policy.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Retryable with backoff (rate limits, gateway errors, timeouts).
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// Not retried; surfaces as a failed turn.
    #[error("provider request failed: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify an error message by its text when no structured status is
    /// available (adapters with HTTP status codes should classify directly).
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_transient_message(&message) {
            Self::Transient(message)
        } else {
            Self::Fatal(message)
        }
    }

    /// Classify an HTTP status code paired with a response body.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = format!("HTTP {}: {}", status, body.into());
        match status {
            408 | 429 => Self::Transient(message),
            500..=599 => Self::Transient(message),
            _ => Self::Fatal(message),
        }
    }
}

pub fn is_transient_message(text: &str) -> bool {
    let lowered = text.to_lowercase();
    TRANSIENT_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_messages_classify_as_transient() {
        let error = ProviderError::from_message("429 Too Many Requests");
        assert!(error.is_transient());
    }

    #[test]
    fn auth_failures_classify_as_fatal() {
        let error = ProviderError::from_message("401 invalid api key");
        assert!(!error.is_transient());
    }

    #[test]
    fn gateway_statuses_retry_and_client_statuses_do_not() {
        assert!(ProviderError::from_status(503, "bad gateway").is_transient());
        assert!(ProviderError::from_status(429, "slow down").is_transient());
        assert!(!ProviderError::from_status(400, "bad request").is_transient());
    }
}
