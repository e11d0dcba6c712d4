//! Shared request-path types: service routes, rate-limit policies, caller identity and
//! the owned request/response values passed between the dispatch stages.

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Number of requests allowed within one fixed window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub requests: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(requests: u32, window: Duration) -> Self {
        Self { requests, window }
    }

    pub fn per_minute(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(60))
    }
}

/// A backend service reachable through the gateway
///
/// Routes are loaded once at startup and never mutated afterwards. The router owns them
/// behind an `Arc` and hands out shared references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRoute {
    /// Unique service name, also used as the circuit breaker and health key
    pub name: String,

    /// Inbound path prefix, e.g. `/api/v1/users`
    pub path_prefix: String,

    /// Base URL of the backend, e.g. `http://user_service:8001`
    pub target_base_url: String,

    /// Path appended to the base URL when probing health
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,

    /// Per-route limit, applied per caller identity
    pub rate_limit: RateLimitPolicy,
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

impl ServiceRoute {
    pub fn new(
        name: impl Into<String>,
        path_prefix: impl Into<String>,
        target_base_url: impl Into<String>,
        rate_limit: RateLimitPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            path_prefix: path_prefix.into(),
            target_base_url: target_base_url.into(),
            health_check_path: default_health_check_path(),
            rate_limit,
        }
    }

    pub fn with_health_check_path(mut self, path: impl Into<String>) -> Self {
        self.health_check_path = path.into();
        self
    }

    /// Full URL the health monitor probes
    pub fn health_check_url(&self) -> String {
        let base = self.target_base_url.trim_end_matches('/');
        if self.health_check_path.starts_with('/') {
            format!("{}{}", base, self.health_check_path)
        } else {
            format!("{}/{}", base, self.health_check_path)
        }
    }
}

/// Who is making a request, as far as rate limiting is concerned
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Authenticated caller, keyed by the token subject
    User(String),
    /// Unauthenticated caller with a known peer address
    Ip(IpAddr),
    /// Neither a token nor a peer address was available
    Anonymous,
}

impl Identity {
    pub fn resolve(user_id: Option<String>, client_ip: Option<IpAddr>) -> Self {
        match (user_id, client_ip) {
            (Some(user), _) => Identity::User(user),
            (None, Some(ip)) => Identity::Ip(ip),
            (None, None) => Identity::Anonymous,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::User(id) => write!(f, "user:{}", id),
            Identity::Ip(ip) => write!(f, "ip:{}", ip),
            Identity::Anonymous => write!(f, "anonymous"),
        }
    }
}

/// Inbound request, fully buffered, as seen by the gateway service
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    pub identity: Identity,
    pub request_id: String,
}

impl GatewayRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_ip: None,
            identity: Identity::Anonymous,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// Buffered backend response
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}
