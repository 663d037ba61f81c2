//! Structured error type shared by every adapter, plus the normalized
//! error-kind taxonomy consulted by router fallback decisions.

use thiserror::Error;

/// Failures that can surface from any provider adapter operation.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Connection failure, timeout, or a decode failure at the HTTP layer.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A non-2xx response the adapter parsed into the backend's error envelope.
    #[error("api error ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        error_type: Option<String>,
        message: String,
    },

    /// Mid-stream decode failure. Fatal to that stream; no partial skipping.
    #[error("stream decode error: {0}")]
    Stream(String),

    /// Configuration validation failure.
    #[error("config error: {0}")]
    Config(String),

    /// JSON encode/decode failure outside the HTTP response body itself.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Every configured fallback (or the primary alone, if none were
    /// configured) failed. Wraps the error that triggered the ladder.
    #[error("all fallbacks exhausted: {source}")]
    FallbacksExhausted { source: Box<ProviderError> },

    /// Every configured stream fallback failed to open.
    #[error("all stream fallbacks exhausted: {source}")]
    StreamFallbacksExhausted { source: Box<ProviderError> },
}

/// The normalized error kinds used exclusively to decide fallback
/// eligibility (`4.2.1`). Nothing else should branch on this; callers
/// that need the original backend detail should match on
/// [`ProviderError`] directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimit,
    ContextWindow,
    Auth,
    Timeout,
    ServerError,
    Unknown,
}

impl ErrorKind {
    /// Whether an error of this kind should trigger the router's
    /// fallback ladder.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::ContextWindow | ErrorKind::ServerError | ErrorKind::Timeout
        )
    }
}

/// Classify a [`ProviderError`] into the normalized taxonomy. HTTP status
/// takes priority; backend-specific codes/messages are consulted next.
pub fn classify(err: &ProviderError) -> ErrorKind {
    match err {
        ProviderError::Api {
            status,
            code,
            message,
            ..
        } => classify_api(*status, code.as_deref(), message),
        ProviderError::Transport(e) => {
            if e.is_timeout() {
                ErrorKind::Timeout
            } else {
                ErrorKind::Unknown
            }
        }
        ProviderError::Cancelled => ErrorKind::Timeout,
        ProviderError::Stream(_) | ProviderError::Json(_) | ProviderError::Config(_) => ErrorKind::Unknown,
        ProviderError::FallbacksExhausted { source } | ProviderError::StreamFallbacksExhausted { source } => {
            classify(source)
        }
    }
}

fn classify_api(status: u16, code: Option<&str>, message: &str) -> ErrorKind {
    match status {
        429 => return ErrorKind::RateLimit,
        401 | 403 => return ErrorKind::Auth,
        s if s >= 500 => return ErrorKind::ServerError,
        408 => return ErrorKind::Timeout,
        _ => {}
    }

    let lower_msg = message.to_ascii_lowercase();
    let lower_code = code.map(|c| c.to_ascii_lowercase()).unwrap_or_default();

    if lower_code.contains("rate_limit") || lower_msg.contains("rate limit") {
        ErrorKind::RateLimit
    } else if lower_code.contains("context_length") || lower_msg.contains("context length") || lower_msg.contains("too many tokens") {
        ErrorKind::ContextWindow
    } else if lower_code.contains("auth") || lower_msg.contains("unauthorized") || lower_msg.contains("invalid api key") {
        ErrorKind::Auth
    } else if lower_msg.contains("timeout") || lower_msg.contains("timed out") {
        ErrorKind::Timeout
    } else {
        ErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_err(status: u16, message: &str) -> ProviderError {
        ProviderError::Api {
            status,
            code: None,
            error_type: None,
            message: message.to_string(),
        }
    }

    #[test]
    fn classifies_rate_limit() {
        assert_eq!(classify(&api_err(429, "rate limited")), ErrorKind::RateLimit);
    }

    #[test]
    fn classifies_auth() {
        assert_eq!(classify(&api_err(401, "invalid api key")), ErrorKind::Auth);
        assert_eq!(classify(&api_err(403, "forbidden")), ErrorKind::Auth);
    }

    #[test]
    fn classifies_server_error() {
        assert_eq!(classify(&api_err(500, "internal error")), ErrorKind::ServerError);
        assert_eq!(classify(&api_err(503, "unavailable")), ErrorKind::ServerError);
    }

    #[test]
    fn classifies_context_window_from_message() {
        assert_eq!(
            classify(&api_err(400, "prompt is too long: context length exceeded")),
            ErrorKind::ContextWindow
        );
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(ErrorKind::ContextWindow.is_retryable());
        assert!(ErrorKind::ServerError.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn fallbacks_exhausted_wraps_and_classifies_source() {
        let primary = api_err(429, "rate limited");
        let wrapped = ProviderError::FallbacksExhausted {
            source: Box::new(primary),
        };
        assert!(wrapped.to_string().contains("all fallbacks exhausted"));
        assert_eq!(classify(&wrapped), ErrorKind::RateLimit);
    }
}
