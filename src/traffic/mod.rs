//! # Traffic Management Module
//!
//! Admission control for inbound requests. The gateway applies fixed-window rate limits
//! at three scopes before any backend is contacted:
//!
//! - **Global**: one window shared by every caller
//! - **Identity**: one window per user id, or per client IP for anonymous callers
//! - **Route**: one window per `(service, identity)` pair

pub mod rate_limiter;

pub use rate_limiter::{RateLimitDecision, RateLimiter};
