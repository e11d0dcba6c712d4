//! # Gateway Service
//!
//! The dispatch core. One call to [`GatewayService::handle`] takes a buffered inbound
//! request through every check in order and returns either the backend response or the
//! error that replaces it:
//!
//! 1. route resolution (404, touches no counters)
//! 2. rate limits: global, then identity, then route (429)
//! 3. circuit breaker admission (503)
//! 4. cached backend health (503)
//! 5. forwarding with retries under the request deadline
//! 6. one circuit breaker outcome per request
//! 7. outcome translation
//!
//! Background jobs (health probes, rate limit window sweeps) are tied to
//! [`GatewayService::start`] and [`GatewayService::shutdown`].

use crate::auth::JwtValidator;
use crate::core::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayRequest, UpstreamResponse};
use crate::observability::health::{HealthMonitor, HealthProbe, HealthStatus, HttpHealthProbe};
use crate::observability::metrics as gateway_metrics;
use crate::proxy::Forwarder;
use crate::routing::{RouteMatch, Router};
use crate::traffic::RateLimiter;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Service label used in metrics for requests that matched no route
const UNROUTED: &str = "unrouted";

/// One row of the aggregate status report
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub path_prefix: String,
    pub health_status: HealthStatus,
    pub circuit_state: CircuitState,
    pub last_check_time: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub failure_count: u32,
}

/// Shared dispatch state, built once from an immutable configuration
pub struct GatewayService {
    config: Arc<GatewayConfig>,
    router: Router,
    rate_limiter: Arc<RateLimiter>,
    breakers: CircuitBreakerRegistry,
    health: Arc<HealthMonitor>,
    forwarder: Forwarder,
    jwt: Option<JwtValidator>,
}

impl GatewayService {
    /// Build the service with HTTP health probing
    pub fn new(config: Arc<GatewayConfig>) -> GatewayResult<Self> {
        let probe: Arc<dyn HealthProbe> = Arc::new(HttpHealthProbe::new()?);
        Self::with_probe(config, probe)
    }

    /// Build the service with a custom health probe
    pub fn with_probe(config: Arc<GatewayConfig>, probe: Arc<dyn HealthProbe>) -> GatewayResult<Self> {
        let router = Router::from_routes(config.routes.clone());
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let breakers = CircuitBreakerRegistry::new(&config.routes, &config.circuit_breaker);
        let health = Arc::new(HealthMonitor::new(
            router.routes().to_vec(),
            config.health_check.clone(),
            probe,
        ));
        let forwarder = Forwarder::new(config.retry.clone(), config.timeouts.clone())?;
        let jwt = JwtValidator::from_config(&config.auth)?;

        info!(
            routes = router.len(),
            circuit_breaker_enabled = breakers.is_enabled(),
            jwt_enabled = jwt.is_some(),
            "Gateway service initialized"
        );

        Ok(Self {
            config,
            router,
            rate_limiter,
            breakers,
            health,
            forwarder,
            jwt,
        })
    }

    /// Dispatch one request
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResult<UpstreamResponse> {
        let started = Instant::now();
        let (service, result) = match self.router.resolve_match(&request.path) {
            Ok(route_match) => {
                let service = route_match.route.name.clone();
                (service, self.dispatch(&request, route_match).await)
            }
            Err(e) => (UNROUTED.to_string(), Err(e)),
        };
        let status = match &result {
            Ok(response) => response.status,
            Err(e) => e.status_code(),
        };
        let duration = started.elapsed();

        gateway_metrics::record_request(&service, request.method.as_str(), status.as_u16(), duration);

        match &result {
            Ok(_) => info!(
                request_id = %request.request_id,
                method = %request.method,
                path = %request.path,
                service = %service,
                status = status.as_u16(),
                duration_ms = duration.as_millis() as u64,
                "Request completed"
            ),
            Err(e) => warn!(
                request_id = %request.request_id,
                method = %request.method,
                path = %request.path,
                service = %service,
                status = status.as_u16(),
                error_code = e.error_code(),
                error = %e,
                duration_ms = duration.as_millis() as u64,
                "Request rejected"
            ),
        }

        result
    }

    async fn dispatch(
        &self,
        request: &GatewayRequest,
        route_match: RouteMatch,
    ) -> GatewayResult<UpstreamResponse> {
        let route = &route_match.route;

        self.rate_limiter.check_request(&request.identity, route)?;

        if !self.breakers.allow(&route.name) {
            let retry_after = self
                .breakers
                .retry_after(&route.name)
                .unwrap_or(self.config.circuit_breaker.recovery_timeout);
            return Err(GatewayError::CircuitOpen {
                service: route.name.clone(),
                retry_after,
            });
        }

        if !self.health.is_healthy(&route.name) {
            // The breaker may have handed out its half-open trial slot above
            self.breakers.release_trial(&route.name);
            return Err(GatewayError::backend_unhealthy(route.name.clone()));
        }

        let deadline = Instant::now() + self.config.timeouts.request_timeout;
        let outcome = self
            .forwarder
            .forward(request, route, &route_match.upstream_path, deadline)
            .await;

        match outcome.call_outcome() {
            Some(call_outcome) => self.breakers.record_outcome(&route.name, call_outcome),
            None => self.breakers.release_trial(&route.name),
        }

        debug!(
            request_id = %request.request_id,
            service = %route.name,
            attempts = outcome.attempt_count(),
            "Forwarding finished"
        );

        outcome.into_response(&route.name)
    }

    /// Per-service health and breaker state in configuration order
    pub fn services_status(&self) -> Vec<ServiceStatus> {
        self.router
            .routes()
            .iter()
            .map(|route| {
                let health = self.health.health(&route.name).unwrap_or_default();
                let (circuit_state, failure_count) = self
                    .breakers
                    .get(&route.name)
                    .map(|breaker| {
                        let snapshot = breaker.snapshot();
                        (snapshot.state, snapshot.failure_count)
                    })
                    .unwrap_or((CircuitState::Closed, 0));

                ServiceStatus {
                    name: route.name.clone(),
                    path_prefix: route.path_prefix.clone(),
                    health_status: health.status,
                    circuit_state,
                    last_check_time: health.last_check_time,
                    consecutive_failures: health.consecutive_failures,
                    failure_count,
                }
            })
            .collect()
    }

    /// Resolve the caller's user id from its bearer token, if validation is configured
    pub fn authenticate(&self, headers: &axum::http::HeaderMap) -> GatewayResult<Option<String>> {
        match &self.jwt {
            Some(validator) => validator.user_id_from_headers(headers),
            None => Ok(None),
        }
    }

    /// Start health probes and the rate limit sweeper
    pub fn start(&self) {
        self.health.start();
        self.rate_limiter.start();
        info!("Gateway background jobs started");
    }

    /// Stop background jobs and wait for them to exit
    pub async fn shutdown(&self) {
        self.health.stop().await;
        self.rate_limiter.stop().await;
        info!("Gateway background jobs stopped");
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }
}
