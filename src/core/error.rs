//! # Error Handling Module
//!
//! Every failure the gateway can produce is a variant of [`GatewayError`], built with the
//! `thiserror` crate. Each variant knows the HTTP status it maps to, the machine-readable
//! error code clients see, and whether it carries a `Retry-After` hint.
//!
//! ## Error Taxonomy
//! - Terminal dispatch rejections: `RouteNotFound`, `RateLimitExceeded`, `CircuitOpen`,
//!   `BackendUnhealthy`
//! - Forwarding failures left after retries: `UpstreamTimeout`, `UpstreamConnection`,
//!   `DeadlineExceeded`
//! - Inbound request problems: `Authentication`, `PayloadTooLarge`, `BadRequest`
//! - Startup problems: `Configuration`, `Internal`
//!
//! A 4xx answer from a backend is *not* an error here. It is passed through verbatim by
//! the gateway service and never reaches this type.
//!
//! ## Rust Concepts Used
//! - `Result<T, E>` with the `?` operator instead of exceptions
//! - `From` implementations so `?` converts library errors automatically
//! - `IntoResponse` so axum handlers can return `GatewayError` directly

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Comprehensive error types for the API Gateway
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// No configured route prefix matches the inbound path
    #[error("No service route matches path: {path}")]
    RouteNotFound { path: String },

    /// A rate-limit scope rejected the request
    #[error("Rate limit exceeded for {scope}: {limit} requests per {window:?}")]
    RateLimitExceeded {
        scope: String,
        limit: u32,
        window: Duration,
        retry_after: Duration,
    },

    /// Circuit breaker is open, no network call was attempted
    #[error("Circuit breaker open for service: {service}")]
    CircuitOpen { service: String, retry_after: Duration },

    /// The health monitor last saw this backend as unhealthy
    #[error("Service temporarily unavailable: {service}")]
    BackendUnhealthy { service: String },

    /// Every attempt timed out waiting for the backend
    #[error("Upstream {service} timed out after {timeout_ms}ms")]
    UpstreamTimeout { service: String, timeout_ms: u64 },

    /// The backend could not be reached
    #[error("Upstream {service} connection failed: {message}")]
    UpstreamConnection { service: String, message: String },

    /// The outer per-request deadline expired before a response arrived
    #[error("Request deadline of {timeout_ms}ms exceeded")]
    DeadlineExceeded { timeout_ms: u64 },

    /// A bearer token was presented but could not be validated
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    /// Request body larger than the configured limit
    #[error("Request body exceeds limit of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// The inbound request could not be read
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an authentication error with a custom reason
    pub fn auth<S: Into<String>>(reason: S) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn route_not_found<S: Into<String>>(path: S) -> Self {
        Self::RouteNotFound { path: path.into() }
    }

    pub fn backend_unhealthy<S: Into<String>>(service: S) -> Self {
        Self::BackendUnhealthy {
            service: service.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::BackendUnhealthy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamConnection { .. } => StatusCode::BAD_GATEWAY,
            Self::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable error code included in every error body
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::BackendUnhealthy { .. } => "BACKEND_UNHEALTHY",
            Self::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            Self::UpstreamConnection { .. } => "UPSTREAM_CONNECTION_FAILED",
            Self::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            Self::Authentication { .. } => "AUTHENTICATION_FAILED",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Hint for the `Retry-After` header, when the rejection is time-bound
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Render the structured error body clients receive
    pub fn to_body(&self, request_id: &str) -> serde_json::Value {
        let mut body = json!({
            "success": false,
            "message": self.to_string(),
            "error_code": self.error_code(),
            "request_id": request_id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        if let Some(retry_after) = self.retry_after() {
            body["retry_after"] = json!(retry_after_secs(retry_after));
        }

        body
    }
}

/// Whole seconds for a `Retry-After` header, never less than one
pub fn retry_after_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

impl From<jsonwebtoken::errors::Error> for GatewayError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Authentication {
            reason: err.to_string(),
        }
    }
}

/// Implement `IntoResponse` so handlers can return `GatewayError` directly
///
/// Handlers that know the request id should prefer [`GatewayError::to_body`]; this
/// conversion is used where no request id is available yet.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.to_body("unknown");
        let mut response = (status, Json(body)).into_response();

        if let Some(retry_after) = self.retry_after() {
            if let Ok(value) = retry_after_secs(retry_after).to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }

        response
    }
}
