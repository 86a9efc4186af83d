//! Limiter Module
//!
//! Per-credential rate limit window tracking.

pub mod rate_limiter;

pub use rate_limiter::{
    parse_rate_limit_headers, RateLimitHeaders, RateLimitSnapshot, RateLimiter,
};
