//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility — these types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

/// Case-insensitive substrings that mark a provider error as rate-limit-class.
const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "quota exceeded",
    "too many requests",
    "rate_limit_exceeded",
    "quota_exceeded",
    "requests per minute",
    "rpm limit",
];

/// Errors that can occur while talking to a backend service.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the service endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed {
        endpoint: String,
        reason: String,
    },

    /// The service endpoint did not respond within the transport timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout {
        duration_secs: u64,
    },

    /// Non-2xx HTTP response from the service endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError {
        status: u16,
        body: String,
    },

    /// The provider reported an error inside an otherwise successful response
    /// (e.g. an `error` object in an SSE event).
    #[error("provider error: {message}")]
    ProviderError {
        message: String,
    },

    /// SSE stream parsing or chunk-level error.
    #[error("stream error: {reason}")]
    StreamError {
        reason: String,
    },

    /// Failed to parse a tool call from the model's response.
    #[error("tool call parse error: {reason}")]
    ToolCallParseError {
        raw_response: String,
        reason: String,
    },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl InferenceError {
    /// The HTTP status code, if this is an `HttpError`.
    pub fn status(&self) -> Option<u16> {
        match self {
            InferenceError::HttpError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Whether the service rejected the request because of rate limiting or
    /// quota exhaustion.
    ///
    /// HTTP 429 always qualifies. Any other error qualifies when its rendered
    /// text mentions one of the known rate-limit phrases — providers disagree
    /// on status codes (some send 403 or 500 with a quota message) but agree
    /// on the wording.
    pub fn is_rate_limited(&self) -> bool {
        if self.status() == Some(429) {
            return true;
        }
        is_rate_limit_text(&self.to_string())
    }
}

/// Check free-form error text against the rate-limit phrase set.
pub fn is_rate_limit_text(text: &str) -> bool {
    let lowered = text.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lowered.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_429_is_rate_limited() {
        let err = InferenceError::HttpError {
            status: 429,
            body: String::new(),
        };
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_quota_message_is_rate_limited() {
        let err = InferenceError::HttpError {
            status: 403,
            body: r#"{"error":{"code":"QUOTA_EXCEEDED","message":"Daily quota exceeded"}}"#
                .to_string(),
        };
        assert!(err.is_rate_limited());

        let err = InferenceError::ProviderError {
            message: "You hit the RPM LIMIT for this key".to_string(),
        };
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_bad_request_is_not_rate_limited() {
        let err = InferenceError::HttpError {
            status: 400,
            body: "malformed request body".to_string(),
        };
        assert!(!err.is_rate_limited());

        let err = InferenceError::ConnectionFailed {
            endpoint: "http://localhost:1".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn test_rate_limit_text_is_case_insensitive() {
        assert!(is_rate_limit_text("Too Many Requests"));
        assert!(is_rate_limit_text("error: rate_limit_exceeded"));
        assert!(is_rate_limit_text("60 Requests Per Minute allowed"));
        assert!(!is_rate_limit_text("invalid api key"));
    }

    #[test]
    fn test_error_body_http_error() {
        let err = InferenceError::HttpError {
            status: 500,
            body: "test body".to_string(),
        };
        assert_eq!(err.error_body(), Some("test body"));
        assert_eq!(err.status(), Some(500));
    }

    #[test]
    fn test_error_body_non_http() {
        let err = InferenceError::Timeout { duration_secs: 5 };
        assert!(err.error_body().is_none());
        assert!(err.status().is_none());
    }
}
