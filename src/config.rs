//! Engine Configuration

use std::time::Duration;

/// Tunables for the dispatch engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upstream chat-completions endpoint
    pub endpoint: String,

    /// Retries after the first attempt; each retry re-selects a credential
    pub max_retries: u32,

    /// Fixed sleep between attempts. Deliberately not exponential: retries
    /// switch to a different credential, so backing off against the same
    /// upstream window buys nothing.
    pub retry_interval: Duration,

    /// Per-attempt upstream timeout
    pub request_timeout: Duration,

    /// How long a failure mark quarantines a credential
    pub failure_timeout: Duration,

    /// Minimum interval between debounced persistence writes
    pub save_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(300),
            failure_timeout: Duration::from_secs(60),
            save_interval: Duration::from_secs(30),
        }
    }
}
