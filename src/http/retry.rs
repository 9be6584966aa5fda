//! Retry policy for network operations.
//!
//! 4xx responses will not get better by asking again; 5xx and transport
//! failures might. The classification happens once, when `error_for_status`
//! fails, and the download loop honours it.

use reqwest::StatusCode;

/// Maximum number of attempts for a network operation.
pub const MAX_RETRIES: usize = 3;

/// Delay between attempts in milliseconds.
pub const RETRY_DELAY_MS: u64 = 1000;

/// Errors that should not be retried.
#[derive(Debug)]
pub enum NonRetryableError {
    /// HTTP 401: bad or missing credentials.
    AuthenticationFailed(String),
    /// HTTP 404: the package, version, or ref does not exist.
    NotFound(String),
    /// HTTP 403 or 429.
    RateLimitedOrForbidden(String),
    /// Any other 4xx.
    ClientError(String),
}

impl std::fmt::Display for NonRetryableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NonRetryableError::AuthenticationFailed(msg) => {
                write!(f, "Authentication failed: {}", msg)
            }
            NonRetryableError::NotFound(msg) => write!(f, "Not found: {}", msg),
            NonRetryableError::RateLimitedOrForbidden(msg) => {
                write!(f, "Access denied or rate limited: {}", msg)
            }
            NonRetryableError::ClientError(msg) => write!(f, "Request error: {}", msg),
        }
    }
}

impl std::error::Error for NonRetryableError {}

impl NonRetryableError {
    /// True when the failure means "this name/version/ref does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, NonRetryableError::NotFound(_))
    }
}

/// Classify an error from `error_for_status()`.
///
/// Retryable errors pass through unchanged; non-retryable ones are wrapped so
/// the retry loop (and the fetcher boundary) can downcast and stop early.
pub fn check_retryable(error: reqwest::Error) -> anyhow::Error {
    let Some(status) = error.status() else {
        return anyhow::Error::from(error);
    };

    let wrapped = match status {
        StatusCode::UNAUTHORIZED => {
            NonRetryableError::AuthenticationFailed("invalid or missing credentials".to_string())
        }
        StatusCode::NOT_FOUND => {
            NonRetryableError::NotFound("the requested resource does not exist".to_string())
        }
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            NonRetryableError::RateLimitedOrForbidden(format!("HTTP {}", status.as_u16()))
        }
        s if s.is_client_error() => NonRetryableError::ClientError(format!("HTTP {}", s.as_u16())),
        // 5xx and everything else: retryable.
        _ => return anyhow::Error::from(error),
    };

    anyhow::Error::from(wrapped)
}

/// True unless the error chain carries a [`NonRetryableError`].
pub fn is_retryable(e: &anyhow::Error) -> bool {
    e.downcast_ref::<NonRetryableError>().is_none()
}
