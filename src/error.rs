//! Keypool Error Types
//!
//! Error taxonomy for the dispatch engine. Transient upstream failures
//! (rate limits, transport errors) are retried by the dispatcher and only
//! surface here once the retry budget is spent; everything else is returned
//! to the caller as-is.

use std::fmt;

/// Main error type for keypool operations
#[derive(Debug)]
pub enum KeypoolError {
    /// Configuration errors (invalid import blob, bad parameters, etc.)
    Config(String),

    /// No enabled credentials in the pool; fatal to the call
    NoKeysAvailable,

    /// Upstream rejected the request as rate limited (429, or 400 classified
    /// as rate limited) and the retry budget is exhausted. Carries the last
    /// upstream response verbatim.
    RateLimited {
        status: u16,
        body: String,
        attempts: u32,
    },

    /// Upstream rejected the request shape (payload too large, context length,
    /// malformed body). Not retried and not attributed to the credential.
    InvalidRequest { status: u16, body: String },

    /// Any other upstream error status after the retry budget is exhausted.
    /// Carries the last upstream response verbatim.
    Upstream {
        status: u16,
        body: String,
        attempts: u32,
    },

    /// Network-level failure talking to the upstream
    Transport(String),

    /// Per-attempt timeout elapsed
    Timeout(String),

    /// The backing configuration store failed a read or write
    Storage(String),

    /// Generic internal error
    Internal(String),
}

impl KeypoolError {
    /// Stable machine-readable code for each error class, safe to expose to
    /// admin/HTTP layers.
    pub fn code(&self) -> &'static str {
        match self {
            KeypoolError::Config(_) => "config_error",
            KeypoolError::NoKeysAvailable => "no_available_keys",
            KeypoolError::RateLimited { .. } => "rate_limited",
            KeypoolError::InvalidRequest { .. } => "invalid_request",
            KeypoolError::Upstream { .. } => "upstream_error",
            KeypoolError::Transport(_) => "transport_error",
            KeypoolError::Timeout(_) => "timeout",
            KeypoolError::Storage(_) => "storage_error",
            KeypoolError::Internal(_) => "internal_error",
        }
    }

    /// True when the dispatcher gave up after retrying, as opposed to
    /// deciding not to retry at all.
    pub fn retried(&self) -> bool {
        matches!(
            self,
            KeypoolError::RateLimited { .. }
                | KeypoolError::Upstream { .. }
                | KeypoolError::Transport(_)
                | KeypoolError::Timeout(_)
        )
    }
}

impl fmt::Display for KeypoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeypoolError::Config(msg) => write!(f, "Configuration error: {}", msg),
            KeypoolError::NoKeysAvailable => {
                write!(
                    f,
                    "No enabled API keys available. All keys have been disabled or removed."
                )
            }
            KeypoolError::RateLimited {
                status,
                body,
                attempts,
            } => {
                write!(
                    f,
                    "Rate limited after {} attempts (last status {}): {}",
                    attempts, status, body
                )
            }
            KeypoolError::InvalidRequest { status, body } => {
                write!(f, "Upstream rejected request (status {}): {}", status, body)
            }
            KeypoolError::Upstream {
                status,
                body,
                attempts,
            } => {
                write!(
                    f,
                    "Upstream error after {} attempts (last status {}): {}",
                    attempts, status, body
                )
            }
            KeypoolError::Transport(msg) => write!(f, "Request failed: {}", msg),
            KeypoolError::Timeout(msg) => write!(f, "Request timeout: {}", msg),
            KeypoolError::Storage(msg) => write!(f, "Storage error: {}", msg),
            KeypoolError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for KeypoolError {}

impl From<reqwest::Error> for KeypoolError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            KeypoolError::Timeout(err.to_string())
        } else if err.is_connect() {
            KeypoolError::Transport(format!("Connection failed: {}", err))
        } else {
            KeypoolError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for KeypoolError {
    fn from(err: serde_json::Error) -> Self {
        KeypoolError::Storage(format!("JSON error: {}", err))
    }
}

/// Result type alias for keypool operations
pub type Result<T> = std::result::Result<T, KeypoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_codes() {
        assert_eq!(KeypoolError::NoKeysAvailable.code(), "no_available_keys");
        assert_eq!(
            KeypoolError::InvalidRequest {
                status: 400,
                body: String::new()
            }
            .code(),
            "invalid_request"
        );
    }

    #[test]
    fn test_retried_distinguishes_classes() {
        assert!(KeypoolError::RateLimited {
            status: 429,
            body: String::new(),
            attempts: 3
        }
        .retried());
        assert!(!KeypoolError::InvalidRequest {
            status: 400,
            body: String::new()
        }
        .retried());
        assert!(!KeypoolError::NoKeysAvailable.retried());
    }
}
