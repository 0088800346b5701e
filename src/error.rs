//! Classified failures of the Conso API.
//!
//! Transport and HTTP outcomes are folded into five variants so that the
//! coordinator can decide between re-authentication, backoff and giving up
//! without looking at raw `reqwest` errors.

use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, LinkyError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkyError {
    /// Token invalid, expired or revoked
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// Meter unknown to this token
    #[error("Meter not found: {message}")]
    NotFound { message: String },

    /// Explicit throttling signal from the API
    #[error("Rate limited by the API")]
    RateLimited { retry_after: Option<Duration> },

    /// Timeouts, 5xx, connection failures
    #[error("Transient error: {message}")]
    Transient { message: String },

    /// Response did not match the expected schema
    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },
}

impl LinkyError {
    pub fn auth<S: Into<String>>(message: S) -> Self {
        LinkyError::Auth {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        LinkyError::NotFound {
            message: message.into(),
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        LinkyError::Transient {
            message: message.into(),
        }
    }

    pub fn malformed<S: Into<String>>(message: S) -> Self {
        LinkyError::MalformedResponse {
            message: message.into(),
        }
    }

    /// Maps a non-success HTTP status onto the taxonomy.
    pub fn from_status(status: StatusCode, retry_after: Option<Duration>) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                LinkyError::auth(format!("API rejected the token ({status})"))
            }
            StatusCode::NOT_FOUND => LinkyError::not_found(format!("API returned {status}")),
            StatusCode::TOO_MANY_REQUESTS => LinkyError::RateLimited { retry_after },
            StatusCode::REQUEST_TIMEOUT => LinkyError::transient(format!("API returned {status}")),
            s if s.is_server_error() => LinkyError::transient(format!("API returned {status}")),
            _ => LinkyError::malformed(format!("unexpected status {status}")),
        }
    }

    /// Rate limiting and transient failures are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkyError::RateLimited { .. } | LinkyError::Transient { .. }
        )
    }

    /// Higher is more serious. Used to pick the cycle-level cause when
    /// several series fail at once.
    pub fn severity(&self) -> u8 {
        match self {
            LinkyError::Auth { .. } => 4,
            LinkyError::NotFound { .. } => 3,
            LinkyError::MalformedResponse { .. } => 2,
            LinkyError::RateLimited { .. } => 1,
            LinkyError::Transient { .. } => 0,
        }
    }

    /// Text shown to the user when setup is refused.
    pub fn user_message(&self) -> String {
        match self {
            LinkyError::Auth { .. } => {
                "The token was rejected. Generate a new one and configure the meter again."
                    .to_string()
            }
            LinkyError::NotFound { .. } => {
                "This meter is not accessible with the supplied token.".to_string()
            }
            LinkyError::RateLimited { .. } => {
                "The API is throttling requests, setup will be retried later.".to_string()
            }
            other => format!("Could not reach the API: {other}"),
        }
    }
}

impl From<reqwest::Error> for LinkyError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return LinkyError::from_status(status, None);
        }
        if err.is_decode() {
            return LinkyError::malformed(err.to_string());
        }
        LinkyError::transient(err.to_string())
    }
}

impl From<serde_json::Error> for LinkyError {
    fn from(err: serde_json::Error) -> Self {
        LinkyError::malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            LinkyError::from_status(StatusCode::UNAUTHORIZED, None),
            LinkyError::Auth { .. }
        ));
        assert!(matches!(
            LinkyError::from_status(StatusCode::FORBIDDEN, None),
            LinkyError::Auth { .. }
        ));
        assert!(matches!(
            LinkyError::from_status(StatusCode::NOT_FOUND, None),
            LinkyError::NotFound { .. }
        ));
        assert_eq!(
            LinkyError::from_status(
                StatusCode::TOO_MANY_REQUESTS,
                Some(Duration::from_secs(30))
            ),
            LinkyError::RateLimited {
                retry_after: Some(Duration::from_secs(30))
            }
        );
        assert!(matches!(
            LinkyError::from_status(StatusCode::BAD_GATEWAY, None),
            LinkyError::Transient { .. }
        ));
        assert!(matches!(
            LinkyError::from_status(StatusCode::BAD_REQUEST, None),
            LinkyError::MalformedResponse { .. }
        ));
    }

    #[test]
    fn test_retryable_and_severity() {
        assert!(LinkyError::transient("x").is_retryable());
        assert!(LinkyError::RateLimited { retry_after: None }.is_retryable());
        assert!(!LinkyError::auth("x").is_retryable());
        assert!(!LinkyError::malformed("x").is_retryable());

        assert!(LinkyError::auth("x").severity() > LinkyError::not_found("x").severity());
        assert!(LinkyError::not_found("x").severity() > LinkyError::malformed("x").severity());
        assert!(
            LinkyError::RateLimited { retry_after: None }.severity()
                > LinkyError::transient("x").severity()
        );
    }

    #[test]
    fn test_error_display() {
        let err = LinkyError::auth("token expired");
        assert_eq!(err.to_string(), "Authentication error: token expired");

        let err = LinkyError::malformed("missing date");
        assert_eq!(err.to_string(), "Malformed response: missing date");
    }
}
