//! # Kerya API Gateway Library
//!
//! The single entry point in front of the Kerya backend services. Every inbound request
//! is routed by path prefix to one backend and passes through rate limiting, a
//! per-service circuit breaker and a cached health check before it is forwarded with
//! timeouts and retries.
//!
//! ## Module layout
//! - `core`: errors, configuration, shared types and the circuit breaker
//! - `routing`: longest-prefix route resolution
//! - `traffic`: fixed-window rate limiting
//! - `proxy`: outbound forwarding with retries
//! - `observability`: backend health monitoring, logging and metrics
//! - `auth`: bearer token validation
//! - `gateway`: the dispatch service and its HTTP surface

/// Core functionality including error types, configuration, and basic data structures
pub mod core;

/// Dispatch service and axum server
pub mod gateway;

/// JWT identity extraction
pub mod auth;

/// Request routing by service path prefix
pub mod routing;

/// Health monitoring, structured logging and Prometheus metrics
pub mod observability;

/// Rate limiting
pub mod traffic;

/// Backend request forwarding
pub mod proxy;

/// Main error type used throughout the gateway
pub use core::error::{GatewayError, GatewayResult};

/// Main configuration structure for the gateway
pub use core::config::GatewayConfig;

pub use core::types::{GatewayRequest, Identity, RateLimitPolicy, ServiceRoute, UpstreamResponse};

pub use routing::router::{Router, RouterBuilder};

pub use gateway::{build_app, GatewayService};
