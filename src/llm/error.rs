//! Completion backend errors with retry classification.
//!
//! Rate limits and malformed structured output are recoverable at the call
//! site; everything else propagates to the agent that issued the call.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// Error from a completion backend call.
#[derive(Debug, Clone)]
pub struct LlmError {
    /// The kind of error
    pub kind: LlmErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
    /// Provider-suggested delay before retrying (Retry-After header or body hint)
    pub retry_after: Option<Duration>,
}

impl LlmError {
    /// Create a rate limit error.
    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            kind: LlmErrorKind::RateLimited,
            status_code: Some(429),
            message,
            retry_after,
        }
    }

    /// Create an error for an overloaded or failing provider.
    pub fn unavailable(status_code: Option<u16>, message: String) -> Self {
        Self {
            kind: LlmErrorKind::Unavailable,
            status_code,
            message,
            retry_after: None,
        }
    }

    /// Create a client error (bad request, auth, etc.).
    pub fn client_error(status_code: u16, message: String) -> Self {
        Self {
            kind: LlmErrorKind::ClientError,
            status_code: Some(status_code),
            message,
            retry_after: None,
        }
    }

    /// Create a parse error for malformed structured output.
    pub fn parse_error(message: String) -> Self {
        Self {
            kind: LlmErrorKind::ParseError,
            status_code: None,
            message,
            retry_after: None,
        }
    }

    /// Create a timeout error.
    pub fn timeout(bound: Duration) -> Self {
        Self {
            kind: LlmErrorKind::Timeout,
            status_code: None,
            message: format!("no response within {:?}", bound),
            retry_after: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: LlmErrorKind::Cancelled,
            status_code: None,
            message: "request cancelled".to_string(),
            retry_after: None,
        }
    }

    /// Check if this error may be retried on the same backend.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Resolve the delay before the next attempt.
    ///
    /// Uses the provider's `retry_after` when present, otherwise `default_delay`.
    pub fn resolved_delay(&self, default_delay: Duration) -> Duration {
        self.retry_after.unwrap_or(default_delay)
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

/// Classification of backend errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Rate limited (429) - retry after the suggested delay
    RateLimited,
    /// Provider overloaded or failing (5xx, 529, connection errors)
    Unavailable,
    /// Client error (400, 401, 403, 404) - permanent
    ClientError,
    /// Response was not the structured shape we asked for - retried like a rate limit
    ParseError,
    /// The call exceeded its time bound
    Timeout,
    /// The call was aborted by its cancellation token
    Cancelled,
}

impl LlmErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmErrorKind::RateLimited | LlmErrorKind::ParseError)
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmErrorKind::RateLimited => write!(f, "Rate limited"),
            LlmErrorKind::Unavailable => write!(f, "Unavailable"),
            LlmErrorKind::ClientError => write!(f, "Client error"),
            LlmErrorKind::ParseError => write!(f, "Parse error"),
            LlmErrorKind::Timeout => write!(f, "Timed out"),
            LlmErrorKind::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::Unavailable,
    }
}

/// Build an error from a non-success HTTP response.
pub fn error_from_status(status: u16, body: &str, retry_after: Option<Duration>) -> LlmError {
    match classify_http_status(status) {
        LlmErrorKind::RateLimited => {
            let hint = retry_after.or_else(|| parse_retry_hint(body));
            LlmError::rate_limited(body.to_string(), hint)
        }
        LlmErrorKind::ClientError => LlmError::client_error(status, body.to_string()),
        _ => LlmError::unavailable(Some(status), body.to_string()),
    }
}

/// Parse a `Retry-After` header value given in seconds.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Extract a "try again in 12.5s" / "try again in 800ms" hint from an error body.
pub fn parse_retry_hint(body: &str) -> Option<Duration> {
    static HINT: OnceLock<Option<Regex>> = OnceLock::new();
    let re = HINT
        .get_or_init(|| Regex::new(r"(?i)try again in\s+(\d+(?:\.\d+)?)\s*(ms|s)\b").ok())
        .as_ref()?;
    let caps = re.captures(body)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let duration = match caps.get(2)?.as_str().to_ascii_lowercase().as_str() {
        "ms" => Duration::from_secs_f64(value / 1000.0),
        _ => Duration::from_secs_f64(value),
    };
    Some(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LlmErrorKind::RateLimited.is_retryable());
        assert!(LlmErrorKind::ParseError.is_retryable());
        assert!(!LlmErrorKind::Unavailable.is_retryable());
        assert!(!LlmErrorKind::ClientError.is_retryable());
        assert!(!LlmErrorKind::Timeout.is_retryable());
        assert!(!LlmErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_http_status_classification() {
        assert_eq!(classify_http_status(429), LlmErrorKind::RateLimited);
        assert_eq!(classify_http_status(500), LlmErrorKind::Unavailable);
        assert_eq!(classify_http_status(529), LlmErrorKind::Unavailable);
        assert_eq!(classify_http_status(400), LlmErrorKind::ClientError);
        assert_eq!(classify_http_status(401), LlmErrorKind::ClientError);
    }

    #[test]
    fn test_retry_hint_parsing() {
        assert_eq!(
            parse_retry_hint("Rate limit reached. Please try again in 12.5s."),
            Some(Duration::from_millis(12_500))
        );
        assert_eq!(
            parse_retry_hint("try again in 800ms"),
            Some(Duration::from_millis(800))
        );
        assert_eq!(parse_retry_hint("slow down"), None);
    }

    #[test]
    fn test_rate_limit_body_hint_used_without_header() {
        let err = error_from_status(429, "Please try again in 3s", None);
        assert_eq!(err.kind, LlmErrorKind::RateLimited);
        assert_eq!(err.retry_after, Some(Duration::from_secs(3)));

        let err = error_from_status(429, "Please try again in 3s", Some(Duration::from_secs(9)));
        assert_eq!(err.retry_after, Some(Duration::from_secs(9)));
    }

    #[test]
    fn test_resolved_delay_prefers_provider() {
        let default = Duration::from_secs(5);
        let error = LlmError::rate_limited("test".to_string(), Some(Duration::from_secs(30)));
        assert_eq!(error.resolved_delay(default), Duration::from_secs(30));

        let error = LlmError::parse_error("bad json".to_string());
        assert_eq!(error.resolved_delay(default), default);
    }
}
