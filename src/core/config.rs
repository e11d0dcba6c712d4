//! # Configuration Module
//!
//! Configuration for the gateway is a single immutable [`GatewayConfig`] value, loaded
//! once at startup from YAML and shared through an `Arc`. Nothing reads settings from
//! globals after startup.
//!
//! ## Key Features
//! - YAML parsing with serde, durations written as `30s` / `500ms` via `humantime_serde`
//! - Every section has defaults, so a partial file (or no file at all) works
//! - Environment variable overrides for the settings operators change most
//! - Validation that collects every problem into one error message
//!
//! ## Loading Order
//! 1. `GATEWAY_CONFIG_PATH` (default `config/gateway.yaml`) is read if it exists
//! 2. A missing file falls back to [`GatewayConfig::default`] with a warning
//! 3. `GATEWAY_*` environment overrides are applied
//! 4. The result is validated

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{RateLimitPolicy, ServiceRoute};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

/// Main gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener and HTTP surface settings
    pub server: ServerConfig,

    /// Backend service routes, in registration order
    pub routes: Vec<ServiceRoute>,

    /// Active health probing of backends
    pub health_check: HealthCheckConfig,

    /// Per-service circuit breaker thresholds
    pub circuit_breaker: CircuitBreakerConfig,

    /// Global and per-identity rate limits
    pub rate_limit: RateLimitConfig,

    /// Retry policy for forwarded requests
    pub retry: RetryConfig,

    /// Connect, read and overall request timeouts
    pub timeouts: TimeoutsConfig,

    /// Bearer token validation
    pub auth: AuthConfig,

    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Parse a YAML document and validate it
    pub fn from_yaml_str(content: &str) -> GatewayResult<Self> {
        let config: GatewayConfig = serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml_str(&content)
    }

    /// Load from `path` if the file exists, otherwise start from defaults
    ///
    /// Environment overrides are applied in both cases, then the result is validated.
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();

        let mut config = if tokio::fs::try_exists(path).await.unwrap_or(false) {
            info!(path = %path.display(), "Loading gateway configuration");
            let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                GatewayError::config(format!("Failed to read config file: {}", e))
            })?;
            serde_yaml::from_str(&content)
                .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?
        } else {
            warn!(
                path = %path.display(),
                "Configuration file not found, using built-in defaults"
            );
            GatewayConfig::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration path from `GATEWAY_CONFIG_PATH`
    pub fn config_path() -> PathBuf {
        std::env::var("GATEWAY_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(host) = env::var("GATEWAY_HOST") {
            self.server.host = host;
        }

        if let Ok(port) = env::var("GATEWAY_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_PORT: {}", e)))?;
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            self.observability.log_level = level;
        }

        if let Ok(format) = env::var("GATEWAY_LOG_FORMAT") {
            self.observability.log_format = format;
        }

        if let Ok(secret) = env::var("GATEWAY_JWT_SECRET") {
            self.auth.jwt_secret = Some(secret);
        }

        if let Ok(retries) = env::var("GATEWAY_MAX_RETRIES") {
            self.retry.max_retries = retries.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_MAX_RETRIES: {}", e))
            })?;
        }

        if let Ok(timeout) = env::var("GATEWAY_REQUEST_TIMEOUT") {
            self.timeouts.request_timeout = humantime::parse_duration(&timeout).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_REQUEST_TIMEOUT: {}", e))
            })?;
        }

        Ok(())
    }

    /// Comprehensive configuration validation with detailed error messages
    ///
    /// Duplicate route prefixes are only a warning: the first registered route wins.
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.host.is_empty() {
            errors.push("server.host cannot be empty".to_string());
        }

        if self.server.request_size_limit == 0 {
            errors.push("server.request_size_limit must be greater than 0".to_string());
        }

        if !self.server.api_prefix.starts_with('/') {
            errors.push(format!(
                "server.api_prefix must start with '/': {}",
                self.server.api_prefix
            ));
        }

        let mut names = HashSet::new();
        for (index, route) in self.routes.iter().enumerate() {
            if route.name.trim().is_empty() {
                errors.push(format!("Route {} has an empty name", index));
            } else if !names.insert(route.name.as_str()) {
                errors.push(format!("Duplicate route name: {}", route.name));
            }

            if !route.path_prefix.starts_with('/') {
                errors.push(format!(
                    "Route '{}' path_prefix must start with '/': {}",
                    route.name, route.path_prefix
                ));
            }

            match Url::parse(&route.target_base_url) {
                Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
                Ok(url) => errors.push(format!(
                    "Route '{}' target_base_url has unsupported scheme '{}'",
                    route.name,
                    url.scheme()
                )),
                Err(e) => errors.push(format!(
                    "Route '{}' has invalid target_base_url '{}': {}",
                    route.name, route.target_base_url, e
                )),
            }

            validate_policy(
                &format!("Route '{}' rate_limit", route.name),
                &route.rate_limit,
                &mut errors,
            );
        }

        for prefix in self.duplicate_prefixes() {
            warn!(
                path_prefix = %prefix,
                "Duplicate route prefix, the first registered route wins"
            );
        }

        if self.health_check.interval.is_zero() {
            errors.push("health_check.interval must be greater than 0".to_string());
        }
        if self.health_check.timeout.is_zero() {
            errors.push("health_check.timeout must be greater than 0".to_string());
        }
        if self.health_check.failure_threshold == 0 {
            errors.push("health_check.failure_threshold must be greater than 0".to_string());
        }

        if self.circuit_breaker.failure_threshold == 0 {
            errors.push("circuit_breaker.failure_threshold must be greater than 0".to_string());
        }

        validate_policy("rate_limit.global", &self.rate_limit.global, &mut errors);
        validate_policy("rate_limit.per_user", &self.rate_limit.per_user, &mut errors);
        if self.rate_limit.cleanup_interval.is_zero() {
            errors.push("rate_limit.cleanup_interval must be greater than 0".to_string());
        }

        if !(1.0..=MAX_BACKOFF_FACTOR).contains(&self.retry.backoff_factor) {
            errors.push(format!(
                "retry.backoff_factor must be between 1.0 and {}, got: {}",
                MAX_BACKOFF_FACTOR, self.retry.backoff_factor
            ));
        }
        if self.retry.retry_delay > MAX_RETRY_DELAY {
            errors.push(format!(
                "retry.retry_delay must be at most {}s",
                MAX_RETRY_DELAY.as_secs()
            ));
        }

        if self.timeouts.connect_timeout.is_zero() {
            errors.push("timeouts.connect_timeout must be greater than 0".to_string());
        }
        if self.timeouts.read_timeout.is_zero() {
            errors.push("timeouts.read_timeout must be greater than 0".to_string());
        }
        if self.timeouts.request_timeout.is_zero() {
            errors.push("timeouts.request_timeout must be greater than 0".to_string());
        }

        match self.auth.jwt_algorithm.to_uppercase().as_str() {
            "HS256" | "HS384" | "HS512" => {}
            _ => errors.push(format!(
                "Unsupported JWT algorithm: {}",
                self.auth.jwt_algorithm
            )),
        }
        if matches!(self.auth.jwt_secret.as_deref(), Some("")) {
            errors.push("auth.jwt_secret cannot be empty when set".to_string());
        }

        match self.observability.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => errors.push(format!("Invalid log level: {}", self.observability.log_level)),
        }

        match self.observability.log_format.to_lowercase().as_str() {
            "json" | "text" => {}
            _ => errors.push(format!(
                "Invalid log format: {}",
                self.observability.log_format
            )),
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }

    /// Prefixes registered by more than one route, after trailing-slash normalisation
    pub fn duplicate_prefixes(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for route in &self.routes {
            let prefix = normalize_prefix(&route.path_prefix);
            if !seen.insert(prefix.clone()) && !duplicates.contains(&prefix) {
                duplicates.push(prefix);
            }
        }
        duplicates
    }
}

fn validate_policy(label: &str, policy: &RateLimitPolicy, errors: &mut Vec<String>) {
    if policy.requests == 0 {
        errors.push(format!("{} requests must be greater than 0", label));
    }
    if policy.window.is_zero() {
        errors.push(format!("{} window must be greater than 0", label));
    }
}

/// Strip trailing slashes from a route prefix, keeping a bare `/`
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            routes: default_routes(),
            health_check: HealthCheckConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            timeouts: TimeoutsConfig::default(),
            auth: AuthConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// The platform's backend services
pub fn default_routes() -> Vec<ServiceRoute> {
    vec![
        ServiceRoute::new(
            "auth",
            "/api/v1/auth",
            "http://user_service:8001",
            RateLimitPolicy::per_minute(100),
        ),
        ServiceRoute::new(
            "users",
            "/api/v1/users",
            "http://user_service:8001",
            RateLimitPolicy::per_minute(200),
        ),
        ServiceRoute::new(
            "properties",
            "/api/v1/properties",
            "http://property_service:8002",
            RateLimitPolicy::per_minute(300),
        ),
        ServiceRoute::new(
            "bookings",
            "/api/v1/bookings",
            "http://booking_service:8003",
            RateLimitPolicy::per_minute(200),
        ),
        ServiceRoute::new(
            "posts",
            "/api/v1/posts",
            "http://post_service:8006",
            RateLimitPolicy::per_minute(150),
        ),
        ServiceRoute::new(
            "reviews",
            "/api/v1/reviews",
            "http://review_service:8005",
            RateLimitPolicy::per_minute(100),
        ),
    ]
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Listening port
    pub port: u16,

    /// Maximum accepted request body, in bytes
    pub request_size_limit: usize,

    /// Origins allowed by CORS
    pub cors_origins: Vec<String>,

    /// Path under which proxied services are mounted
    pub api_prefix: String,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            request_size_limit: 10 * 1024 * 1024, // 10MB
            cors_origins: vec!["http://localhost:3000".to_string()],
            api_prefix: "/api/v1".to_string(),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Consecutive failed probes before a service is marked unhealthy
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,

    /// Consecutive transient failures before the circuit opens
    pub failure_threshold: u32,

    /// Time the circuit stays open before a trial request is allowed
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Shared across every caller
    pub global: RateLimitPolicy,

    /// Applied per user id, or per client IP for anonymous callers
    pub per_user: RateLimitPolicy,

    /// How often expired windows are swept
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: RateLimitPolicy::per_minute(1000),
            per_user: RateLimitPolicy::per_minute(100),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Retry configuration for forwarded requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,

    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Multiplier applied to the delay for each further retry
    pub backoff_factor: f64,

    /// Retry methods other than GET and HEAD
    pub retry_non_idempotent: bool,
}

/// Upper bound for a single backoff delay
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Largest accepted `retry.backoff_factor`
pub const MAX_BACKOFF_FACTOR: f64 = 10.0;

impl RetryConfig {
    /// Delay before retry number `retry` (1-based)
    ///
    /// Saturates at [`MAX_RETRY_DELAY`] instead of overflowing.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if self.retry_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.retry_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .map(|delay| delay.min(MAX_RETRY_DELAY))
            .unwrap_or(MAX_RETRY_DELAY)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            retry_non_idempotent: false,
        }
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// TCP connect timeout for backend connections
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Per-attempt timeout waiting for a backend response
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Overall deadline for one inbound request, retries included
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret for HMAC-signed tokens; validation is off when unset
    #[serde(skip_serializing)]
    pub jwt_secret: Option<String>,

    pub jwt_algorithm: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_algorithm: "HS256".to_string(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,

    /// `json` or `text`
    pub log_format: String,

    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            metrics_enabled: true,
        }
    }
}
