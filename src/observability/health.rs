//! # Backend Health Monitoring
//!
//! The [`HealthMonitor`] probes every configured backend on a fixed interval and caches
//! an up/down status per service. The request path only ever reads that cache, so a
//! health lookup never waits on the network.
//!
//! ## State Machine
//! - Every service starts `Unknown`, which counts as healthy for routing
//! - A successful probe (2xx) marks the service `Healthy` and resets the failure count
//! - A failed probe (timeout, connection error, non-2xx) increments the failure count;
//!   once it reaches `failure_threshold` the service becomes `Unhealthy`, below that the
//!   previous status is kept
//! - Forwarding outcomes never change health; that is the circuit breaker's job
//!
//! ## Rust Concepts Used
//! - `async_trait` so the probe can be swapped for a scripted one in tests
//! - One `parking_lot::RwLock` per service inside an immutable `HashMap`
//! - `CancellationToken` to stop the per-service probe loops on shutdown
//! - `tokio::sync::broadcast` to publish status changes to any listener

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use reqwest::Client as HttpClient;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::HealthCheckConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceRoute;
use crate::observability::metrics as gateway_metrics;

/// Cached health status of one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Whether requests may be routed; `Unknown` is given the benefit of the doubt
    pub fn is_routable(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health record for one service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub last_check_time: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Reason for the most recent failed probe
    pub last_error: Option<String>,
}

impl Default for ServiceHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_check_time: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Result of one probe
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Success { latency: Duration },
    Failure { reason: String },
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success { .. })
    }
}

/// Health check probe trait for different kinds of probes
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe one service, giving up after `timeout`
    async fn probe(&self, route: &ServiceRoute, timeout: Duration) -> ProbeOutcome;

    /// Get the probe type name
    fn probe_type(&self) -> &'static str;
}

/// HTTP health check probe implementation
pub struct HttpHealthProbe {
    client: HttpClient,
}

impl HttpHealthProbe {
    /// Create a new HTTP health probe
    pub fn new() -> GatewayResult<Self> {
        let client = HttpClient::builder()
            .build()
            .map_err(|e| GatewayError::internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, route: &ServiceRoute, timeout: Duration) -> ProbeOutcome {
        let url = route.health_check_url();
        let start_time = Instant::now();

        match tokio::time::timeout(timeout, self.client.get(&url).send()).await {
            Ok(Ok(response)) if response.status().is_success() => ProbeOutcome::Success {
                latency: start_time.elapsed(),
            },
            Ok(Ok(response)) => ProbeOutcome::Failure {
                reason: format!("Unexpected status code: {}", response.status().as_u16()),
            },
            Ok(Err(e)) => ProbeOutcome::Failure {
                reason: format!("HTTP request failed: {}", e),
            },
            Err(_) => ProbeOutcome::Failure {
                reason: format!("Health check timed out after {:?}", timeout),
            },
        }
    }

    fn probe_type(&self) -> &'static str {
        "http"
    }
}

/// Health check event types
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    /// A service moved between statuses
    StatusChanged {
        service: String,
        old_status: HealthStatus,
        new_status: HealthStatus,
    },
}

struct ProbeTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Monitor that owns the health state of every configured backend
pub struct HealthMonitor {
    /// Routes in configuration order
    routes: Vec<Arc<ServiceRoute>>,
    /// Fixed at construction, one lock per service
    health: HashMap<String, RwLock<ServiceHealth>>,
    probe: Arc<dyn HealthProbe>,
    config: HealthCheckConfig,
    events: broadcast::Sender<HealthEvent>,
    tasks: Mutex<Option<ProbeTasks>>,
}

impl HealthMonitor {
    pub fn new(
        routes: Vec<Arc<ServiceRoute>>,
        config: HealthCheckConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let health = routes
            .iter()
            .map(|route| (route.name.clone(), RwLock::new(ServiceHealth::default())))
            .collect();
        let (events, _) = broadcast::channel(256);

        Self {
            routes,
            health,
            probe,
            config,
            events,
            tasks: Mutex::new(None),
        }
    }

    /// Non-blocking read of the cached status; unknown services are routable
    pub fn is_healthy(&self, service: &str) -> bool {
        self.status(service)
            .map(|status| status.is_routable())
            .unwrap_or(true)
    }

    pub fn status(&self, service: &str) -> Option<HealthStatus> {
        self.health.get(service).map(|health| health.read().status)
    }

    pub fn health(&self, service: &str) -> Option<ServiceHealth> {
        self.health.get(service).map(|health| health.read().clone())
    }

    /// Subscribe to status change events
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Run one probe for `service` now and fold the result into its state
    pub async fn check_now(&self, service: &str) -> GatewayResult<HealthStatus> {
        let route = self
            .routes
            .iter()
            .find(|route| route.name == service)
            .cloned()
            .ok_or_else(|| GatewayError::internal(format!("No health state for service: {}", service)))?;

        let outcome = self.probe.probe(&route, self.config.timeout).await;
        Ok(self.record_probe(service, outcome))
    }

    /// Apply one probe result to the service's state machine
    pub fn record_probe(&self, service: &str, outcome: ProbeOutcome) -> HealthStatus {
        let Some(state) = self.health.get(service) else {
            return HealthStatus::Unknown;
        };

        gateway_metrics::record_health_probe(service, outcome.is_success());

        let (old_status, new_status, failures) = {
            let mut health = state.write();
            let old_status = health.status;
            health.last_check_time = Some(Utc::now());

            match &outcome {
                ProbeOutcome::Success { latency } => {
                    debug!(service = %service, latency_ms = latency.as_millis() as u64, "Health probe succeeded");
                    health.status = HealthStatus::Healthy;
                    health.consecutive_failures = 0;
                    health.last_error = None;
                }
                ProbeOutcome::Failure { reason } => {
                    health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                    health.last_error = Some(reason.clone());
                    if health.consecutive_failures >= self.config.failure_threshold {
                        health.status = HealthStatus::Unhealthy;
                    }
                    debug!(
                        service = %service,
                        consecutive_failures = health.consecutive_failures,
                        reason = %reason,
                        "Health probe failed"
                    );
                }
            }

            (old_status, health.status, health.consecutive_failures)
        };

        if old_status != new_status {
            match new_status {
                HealthStatus::Unhealthy => warn!(
                    service = %service,
                    from = %old_status,
                    consecutive_failures = failures,
                    "Service marked unhealthy"
                ),
                _ => info!(service = %service, from = %old_status, to = %new_status, "Service health changed"),
            }

            // No receivers is fine
            let _ = self.events.send(HealthEvent::StatusChanged {
                service: service.to_string(),
                old_status,
                new_status,
            });
        }

        new_status
    }

    /// Spawn one probe loop per service; the first probe runs immediately
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            warn!("Health monitor already running");
            return;
        }

        let cancel = CancellationToken::new();
        let handles = self
            .routes
            .iter()
            .map(|route| {
                let monitor = Arc::clone(self);
                let token = cancel.clone();
                let service = route.name.clone();
                let period = self.config.interval;

                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = ticker.tick() => {
                                // Dropping the probe future on cancel aborts an in-flight check
                                tokio::select! {
                                    _ = token.cancelled() => break,
                                    result = monitor.check_now(&service) => {
                                        if let Err(e) = result {
                                            warn!(service = %service, error = %e, "Health check could not run");
                                        }
                                    }
                                }
                            }
                        }
                    }
                    debug!(service = %service, "Health probe loop stopped");
                })
            })
            .collect();

        info!(
            services = self.routes.len(),
            interval = ?self.config.interval,
            probe = self.probe.probe_type(),
            "Health monitor started"
        );
        *tasks = Some(ProbeTasks { cancel, handles });
    }

    /// Cancel the probe loops and wait for them to finish
    pub async fn stop(&self) {
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.cancel.cancel();
            for result in join_all(tasks.handles).await {
                if let Err(e) = result {
                    warn!(error = %e, "Health probe task did not shut down cleanly");
                }
            }
            info!("Health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RateLimitPolicy;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Probe that replays a script, then repeats its last answer
    struct ScriptedProbe {
        script: Mutex<VecDeque<bool>>,
        last: Mutex<bool>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(script: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                last: Mutex::new(true),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, _route: &ServiceRoute, _timeout: Duration) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let healthy = match self.script.lock().pop_front() {
                Some(next) => {
                    *self.last.lock() = next;
                    next
                }
                None => *self.last.lock(),
            };
            if healthy {
                ProbeOutcome::Success {
                    latency: Duration::from_millis(1),
                }
            } else {
                ProbeOutcome::Failure {
                    reason: "scripted failure".to_string(),
                }
            }
        }

        fn probe_type(&self) -> &'static str {
            "scripted"
        }
    }

    fn route(name: &str, base: &str) -> Arc<ServiceRoute> {
        Arc::new(ServiceRoute::new(
            name,
            format!("/api/v1/{}", name),
            base,
            RateLimitPolicy::per_minute(100),
        ))
    }

    fn monitor(probe: Arc<dyn HealthProbe>) -> HealthMonitor {
        HealthMonitor::new(
            vec![route("users", "http://user_service:8001")],
            HealthCheckConfig::default(),
            probe,
        )
    }

    #[tokio::test]
    async fn test_unknown_counts_as_healthy() {
        let monitor = monitor(ScriptedProbe::new(&[]));
        assert_eq!(monitor.status("users"), Some(HealthStatus::Unknown));
        assert!(monitor.is_healthy("users"));
        assert!(monitor.is_healthy("not-configured"));
    }

    #[tokio::test]
    async fn test_repeated_healthy_probes() {
        let monitor = monitor(ScriptedProbe::new(&[true, true, true]));

        for _ in 0..3 {
            assert_eq!(monitor.check_now("users").await.unwrap(), HealthStatus::Healthy);
        }

        let health = monitor.health("users").unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_check_time.is_some());
    }

    #[tokio::test]
    async fn test_failures_below_threshold_keep_previous_status() {
        let monitor = monitor(ScriptedProbe::new(&[true, false, false, false, true]));

        monitor.check_now("users").await.unwrap();
        assert_eq!(monitor.check_now("users").await.unwrap(), HealthStatus::Healthy);
        assert_eq!(monitor.check_now("users").await.unwrap(), HealthStatus::Healthy);
        assert_eq!(monitor.health("users").unwrap().consecutive_failures, 2);

        assert_eq!(monitor.check_now("users").await.unwrap(), HealthStatus::Unhealthy);
        assert!(!monitor.is_healthy("users"));
        assert_eq!(
            monitor.health("users").unwrap().last_error.as_deref(),
            Some("scripted failure")
        );

        assert_eq!(monitor.check_now("users").await.unwrap(), HealthStatus::Healthy);
        assert_eq!(monitor.health("users").unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_status_change_events() {
        let monitor = monitor(ScriptedProbe::new(&[true, true, false, false, false]));
        let mut events = monitor.subscribe();

        for _ in 0..5 {
            monitor.check_now("users").await.unwrap();
        }

        assert_eq!(
            events.try_recv().unwrap(),
            HealthEvent::StatusChanged {
                service: "users".to_string(),
                old_status: HealthStatus::Unknown,
                new_status: HealthStatus::Healthy,
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            HealthEvent::StatusChanged {
                service: "users".to_string(),
                old_status: HealthStatus::Healthy,
                new_status: HealthStatus::Unhealthy,
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_check_now_unknown_service() {
        let monitor = monitor(ScriptedProbe::new(&[]));
        assert!(monitor.check_now("ghost").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_probing_lifecycle() {
        let probe = ScriptedProbe::new(&[]);
        let monitor = Arc::new(monitor(probe.clone()));

        monitor.start();
        assert!(monitor.is_running());

        // Probes at t=0, 30s and 60s
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert_eq!(monitor.status("users"), Some(HealthStatus::Healthy));

        monitor.stop().await;
        assert!(!monitor.is_running());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_http_probe_against_backend() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ready"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let probe = HttpHealthProbe::new().unwrap();
        let healthy = route("users", &server.uri());
        let outcome = probe.probe(&healthy, Duration::from_secs(2)).await;
        assert!(outcome.is_success());

        let not_ready = ServiceRoute::clone(&healthy).with_health_check_path("/ready");
        match probe.probe(&not_ready, Duration::from_secs(2)).await {
            ProbeOutcome::Failure { reason } => assert!(reason.contains("503")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_probe_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let probe = HttpHealthProbe::new().unwrap();
        let outcome = probe
            .probe(&route("users", &server.uri()), Duration::from_millis(50))
            .await;
        assert!(matches!(outcome, ProbeOutcome::Failure { ref reason } if reason.contains("timed out")));
    }
}
