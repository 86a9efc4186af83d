//! Dispatch Module
//!
//! HTTP sending and per-call orchestration.

pub mod dispatcher;
pub mod http;

pub use dispatcher::Dispatcher;
pub use http::{HttpClient, UpstreamResponse};
