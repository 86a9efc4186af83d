//! Dispatch Orchestration
//!
//! Drives one logical outbound call: select a credential, send, classify the
//! outcome, then retry against a different credential or return. Retries are
//! bounded by `max_retries` with a fixed sleep between attempts; every retry
//! re-selects, so a quarantined credential is not reused while alternatives
//! exist.

use crate::config::EngineConfig;
use crate::dispatch::http::{HttpClient, UpstreamResponse};
use crate::error::{KeypoolError, Result};
use crate::limiter::{parse_rate_limit_headers, RateLimiter};
use crate::pool::{KeyRegistry, KeySelector};
use crate::stats::StatsTracker;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// How the dispatcher reacts to one upstream response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    /// Transient; quarantine the key and try another
    RateLimited,
    /// The request itself is at fault; do not blame the key, do not retry
    InvalidRequest,
    /// Anything else; retry while budget remains, without quarantining
    Other,
}

/// Pull a human-readable error message out of an upstream error body.
/// Falls back to the raw body when it is not the expected JSON shape.
fn error_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        if let Some(msg) = parsed.get("message").and_then(Value::as_str) {
            return msg.to_string();
        }
        if let Some(msg) = parsed
            .pointer("/error/message")
            .and_then(Value::as_str)
        {
            return msg.to_string();
        }
    }
    body.to_string()
}

const RATE_LIMIT_KEYWORDS: &[&str] = &["rate", "limit", "quota", "too many"];
const INVALID_REQUEST_KEYWORDS: &[&str] = &[
    "too large",
    "too long",
    "context",
    "length",
    "token",
    "invalid",
    "processing error",
];

/// Classify a non-2xx upstream response.
///
/// A 400 is only treated as rate limiting when the response headers show the
/// quota at (or within 10% of) zero, or the error message carries rate/quota
/// wording; a 400 that reads as a request-shape problem is terminal and not
/// attributed to the credential.
fn classify(resp: &UpstreamResponse) -> Outcome {
    if resp.is_success() {
        return Outcome::Success;
    }
    if resp.status == 429 {
        return Outcome::RateLimited;
    }
    if resp.status != 400 {
        return Outcome::Other;
    }

    if let Some(h) = parse_rate_limit_headers(&resp.headers) {
        if h.remaining == 0 || (h.limit > 0 && h.remaining <= (h.limit as i64) / 10) {
            return Outcome::RateLimited;
        }
    }

    let msg = error_message(&resp.body).to_lowercase();
    if RATE_LIMIT_KEYWORDS.iter().any(|k| msg.contains(k)) {
        return Outcome::RateLimited;
    }
    if INVALID_REQUEST_KEYWORDS.iter().any(|k| msg.contains(k)) {
        return Outcome::InvalidRequest;
    }
    Outcome::Other
}

/// Orchestrates outbound calls over the key pool
pub struct Dispatcher {
    registry: Arc<KeyRegistry>,
    limiter: Arc<RateLimiter>,
    selector: Arc<KeySelector>,
    stats: Arc<StatsTracker>,
    http: HttpClient,
    endpoint: String,
    max_retries: u32,
    retry_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<KeyRegistry>,
        limiter: Arc<RateLimiter>,
        selector: Arc<KeySelector>,
        stats: Arc<StatsTracker>,
        config: &EngineConfig,
    ) -> Result<Self> {
        Ok(Self {
            registry,
            limiter,
            selector,
            stats,
            http: HttpClient::new(config.request_timeout)?,
            endpoint: config.endpoint.clone(),
            max_retries: config.max_retries,
            retry_interval: config.retry_interval,
        })
    }

    /// Pick the credential for this attempt. Falls back to the soonest-to-reset
    /// credential when the whole eligible set is exhausted or quarantined;
    /// enabled credentials with no rate limit data count as available.
    fn select_key(&self, enabled: &[usize]) -> Result<usize> {
        let candidates: Vec<usize> = enabled
            .iter()
            .copied()
            .filter(|&idx| !self.limiter.is_exhausted(idx))
            .collect();

        let mode = self.registry.aggregation_mode();
        let mut index = match self.selector.select_next(&candidates, mode) {
            Some(idx) => idx,
            None => self
                .limiter
                .get_next_available(enabled)
                .ok_or(KeypoolError::NoKeysAvailable)?,
        };

        // Proactive rotation: move off a key that hit its use threshold or
        // whose remaining quota dropped to zero.
        let remaining = self.limiter.snapshot(index).map(|s| s.remaining);
        let calls_per_rotation = self.registry.calls_per_rotation();
        if self
            .selector
            .should_rotate(index, remaining, calls_per_rotation)
        {
            let others: Vec<usize> = candidates.iter().copied().filter(|&i| i != index).collect();
            if let Some(next) = self.limiter.get_next_available(&others) {
                tracing::info!(from = index, to = next, "rotating key");
                index = next;
            }
        }

        Ok(index)
    }

    /// Execute one logical call. On success returns the upstream response;
    /// on failure returns the last upstream diagnostic rather than a
    /// synthetic error.
    pub async fn dispatch(&self, model: &str, body: &Value) -> Result<UpstreamResponse> {
        if self.registry.enabled_indices().is_empty() {
            tracing::error!("no enabled API keys available");
            return Err(KeypoolError::NoKeysAvailable);
        }

        let attempts = self.max_retries + 1;
        let mut last_err: Option<KeypoolError> = None;

        for attempt in 1..=attempts {
            // Re-check each round: keys may have been disabled mid-retry.
            let enabled = self.registry.enabled_indices();
            if enabled.is_empty() {
                return Err(KeypoolError::NoKeysAvailable);
            }

            let index = self.select_key(&enabled)?;
            let secret = match self.registry.secret(index) {
                Some(s) => s,
                // Deleted between selection and send; pick again.
                None => continue,
            };
            let masked = crate::pool::mask_key(&secret);

            tracing::info!(model, key = %masked, attempt, attempts, index, "dispatching request");

            let resp = match self.http.post_json(&self.endpoint, &secret, body).await {
                Ok(resp) => resp,
                Err(e) => {
                    self.stats.record_call(index, false, model, &masked);
                    if attempt < attempts {
                        tracing::warn!(key = %masked, error = %e, "transport failure, retrying");
                        tokio::time::sleep(self.retry_interval).await;
                        last_err = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            };

            if let Some(h) = parse_rate_limit_headers(&resp.headers) {
                self.limiter.update(index, h.limit, h.remaining, h.reset);
            }

            match classify(&resp) {
                Outcome::Success => {
                    self.stats.record_call(index, true, model, &masked);
                    tracing::info!(model, key = %masked, status = resp.status, "request succeeded");
                    return Ok(resp);
                }
                Outcome::RateLimited => {
                    self.selector
                        .mark_failed(index, &format!("rate limited ({})", resp.status));
                    self.stats.record_call(index, false, model, &masked);
                    if attempt < attempts {
                        tracing::warn!(
                            key = %masked,
                            status = resp.status,
                            "rate limited, switching key"
                        );
                        tokio::time::sleep(self.retry_interval).await;
                        last_err = Some(KeypoolError::RateLimited {
                            status: resp.status,
                            body: resp.body,
                            attempts: attempt,
                        });
                        continue;
                    }
                    return Err(KeypoolError::RateLimited {
                        status: resp.status,
                        body: resp.body,
                        attempts,
                    });
                }
                Outcome::InvalidRequest => {
                    // The request is at fault, not the credential: no
                    // quarantine, no retry, body returned verbatim.
                    self.stats.record_call(index, false, model, &masked);
                    tracing::warn!(status = resp.status, "upstream rejected request shape");
                    return Err(KeypoolError::InvalidRequest {
                        status: resp.status,
                        body: resp.body,
                    });
                }
                Outcome::Other => {
                    self.stats.record_call(index, false, model, &masked);
                    if attempt < attempts {
                        tracing::warn!(
                            key = %masked,
                            status = resp.status,
                            "upstream error, retrying"
                        );
                        tokio::time::sleep(self.retry_interval).await;
                        last_err = Some(KeypoolError::Upstream {
                            status: resp.status,
                            body: resp.body,
                            attempts: attempt,
                        });
                        continue;
                    }
                    return Err(KeypoolError::Upstream {
                        status: resp.status,
                        body: resp.body,
                        attempts,
                    });
                }
            }
        }

        Err(last_err.unwrap_or(KeypoolError::NoKeysAvailable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{AddMode, AggregationMode};
    use crate::store::MemoryStore;
    use reqwest::header::HeaderMap;
    use serde_json::json;

    struct Fixture {
        registry: Arc<KeyRegistry>,
        limiter: Arc<RateLimiter>,
        selector: Arc<KeySelector>,
        stats: Arc<StatsTracker>,
    }

    fn fixture(secrets: &[&str]) -> Fixture {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(KeyRegistry::new(store.clone()));
        if !secrets.is_empty() {
            registry
                .add_keys(
                    &secrets.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                    AddMode::Append,
                )
                .unwrap();
        }
        Fixture {
            registry,
            limiter: Arc::new(RateLimiter::new(store.clone(), Duration::from_secs(30))),
            selector: Arc::new(KeySelector::new()),
            stats: Arc::new(StatsTracker::new(store, Duration::from_secs(30))),
        }
    }

    fn dispatcher(f: &Fixture, endpoint: String) -> Dispatcher {
        let config = EngineConfig {
            endpoint,
            max_retries: 2,
            retry_interval: Duration::from_millis(10),
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        Dispatcher::new(
            f.registry.clone(),
            f.limiter.clone(),
            f.selector.clone(),
            f.stats.clone(),
            &config,
        )
        .unwrap()
    }

    fn resp(status: u16, body: &str) -> UpstreamResponse {
        UpstreamResponse {
            status,
            headers: HeaderMap::new(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_classify_429() {
        assert_eq!(classify(&resp(429, "")), Outcome::RateLimited);
    }

    #[test]
    fn test_classify_400_by_message() {
        assert_eq!(
            classify(&resp(400, r#"{"message": "Rate limit exceeded for key"}"#)),
            Outcome::RateLimited
        );
        assert_eq!(
            classify(&resp(400, r#"{"error": {"message": "context length exceeded"}}"#)),
            Outcome::InvalidRequest
        );
        assert_eq!(
            classify(&resp(400, r#"{"message": "something odd"}"#)),
            Outcome::Other
        );
    }

    #[test]
    fn test_classify_400_by_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", "100".parse().unwrap());
        headers.insert("x-ratelimit-remaining", "5".parse().unwrap());
        let r = UpstreamResponse {
            status: 400,
            headers,
            body: "{}".to_string(),
        };
        // 5 remaining of 100 is within the 10% threshold.
        assert_eq!(classify(&r), Outcome::RateLimited);
    }

    #[test]
    fn test_classify_other_status() {
        assert_eq!(classify(&resp(500, "boom")), Outcome::Other);
        assert_eq!(classify(&resp(200, "ok")), Outcome::Success);
    }

    #[tokio::test]
    async fn test_no_keys_fails_fast() {
        let f = fixture(&[]);
        let d = dispatcher(&f, "http://127.0.0.1:1/unused".to_string());
        let err = d.dispatch("gpt-4", &json!({})).await.unwrap_err();
        assert!(matches!(err, KeypoolError::NoKeysAvailable));
        assert_eq!(err.code(), "no_available_keys");
    }

    #[tokio::test]
    async fn test_retries_across_keys_then_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let path = "/v1/chat/completions";

        // Round robin picks index 0 first; after its quarantine the counter
        // continues over the shrunken eligible set [1, 2] and lands on 2,
        // then on 1. So the hit order is key-one, key-three, key-two.
        let m1 = server
            .mock("POST", path)
            .match_header("authorization", "key-one-00000000")
            .with_status(429)
            .with_body(r#"{"message": "too many requests"}"#)
            .create_async()
            .await;
        let m2 = server
            .mock("POST", path)
            .match_header("authorization", "key-three-00000000")
            .with_status(429)
            .with_body(r#"{"message": "too many requests"}"#)
            .create_async()
            .await;
        let m3 = server
            .mock("POST", path)
            .match_header("authorization", "key-two-00000000")
            .with_status(200)
            .with_body(r#"{"choices": []}"#)
            .create_async()
            .await;

        let f = fixture(&["key-one-00000000", "key-two-00000000", "key-three-00000000"]);
        f.registry.set_aggregation_mode(AggregationMode::RoundRobin);
        let d = dispatcher(&f, format!("{}{}", server.url(), path));

        let resp = d.dispatch("gpt-4", &json!({"model": "gpt-4"})).await.unwrap();
        assert_eq!(resp.status, 200);

        m1.assert_async().await;
        m2.assert_async().await;
        m3.assert_async().await;

        // The two rate-limited keys are quarantined, the winner is not.
        assert_eq!(f.selector.failed_keys(), vec![0, 2]);

        // 2 failures + 1 success across three distinct credentials.
        assert_eq!(f.stats.get(0).unwrap().failure_count, 1);
        assert_eq!(f.stats.get(2).unwrap().failure_count, 1);
        assert_eq!(f.stats.get(1).unwrap().success_count, 1);
    }

    #[tokio::test]
    async fn test_invalid_request_not_retried_and_key_not_blamed() {
        let mut server = mockito::Server::new_async().await;
        let path = "/v1/chat/completions";

        let m = server
            .mock("POST", path)
            .with_status(400)
            .with_body(r#"{"error": {"message": "context length exceeded"}}"#)
            .expect(1)
            .create_async()
            .await;

        let f = fixture(&["key-one-00000000", "key-two-00000000"]);
        let d = dispatcher(&f, format!("{}{}", server.url(), path));

        let err = d.dispatch("gpt-4", &json!({})).await.unwrap_err();
        match err {
            KeypoolError::InvalidRequest { status, ref body } => {
                assert_eq!(status, 400);
                assert!(body.contains("context length exceeded"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!err.retried());

        m.assert_async().await;
        assert!(f.selector.failed_keys().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_budget_returns_last_upstream_error() {
        let mut server = mockito::Server::new_async().await;
        let path = "/v1/chat/completions";

        let m = server
            .mock("POST", path)
            .with_status(429)
            .with_body(r#"{"message": "slow down"}"#)
            .expect(3)
            .create_async()
            .await;

        let f = fixture(&["only-key-00000000"]);
        let d = dispatcher(&f, format!("{}{}", server.url(), path));

        let err = d.dispatch("gpt-4", &json!({})).await.unwrap_err();
        match err {
            KeypoolError::RateLimited {
                status,
                ref body,
                attempts,
            } => {
                assert_eq!(status, 429);
                assert!(body.contains("slow down"));
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.retried());

        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_rate_limit_headers_feed_the_limiter() {
        let mut server = mockito::Server::new_async().await;
        let path = "/v1/chat/completions";

        let _m = server
            .mock("POST", path)
            .with_status(200)
            .with_header("x-ratelimit-limit", "100")
            .with_header("x-ratelimit-remaining", "73")
            .with_header("x-ratelimit-reset", "60")
            .with_body(r#"{"choices": []}"#)
            .create_async()
            .await;

        let f = fixture(&["only-key-00000000"]);
        let d = dispatcher(&f, format!("{}{}", server.url(), path));

        d.dispatch("gpt-4", &json!({})).await.unwrap();

        let snap = f.limiter.snapshot(0).unwrap();
        assert_eq!(snap.limit, 100);
        assert_eq!(snap.remaining, 73);
        assert!(snap.reset_in_seconds > 0);
    }
}
