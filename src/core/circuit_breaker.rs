//! Circuit Breaker Implementation
//!
//! Each backend service gets its own circuit breaker so that a failing service is cut
//! off quickly instead of tying up gateway tasks on doomed requests. The breaker follows
//! the classic three-state machine.
//!
//! ## States:
//! - **Closed**: Normal operation, consecutive transient failures are counted
//! - **Open**: Requests fail fast with 503 until `recovery_timeout` has elapsed
//! - **HalfOpen**: Exactly one trial request is let through to probe recovery
//!
//! ## Outcome Classification
//! Only transient failures (timeouts, connection errors, 5xx) count against a service.
//! A 4xx answer proves the backend is alive but says nothing about its health, so it
//! neither increments nor resets the counter. In half-open it simply frees the trial slot.
//!
//! ## Key Rust Concepts:
//! - One `parking_lot::Mutex` per breaker, the registry map itself is immutable
//! - `tokio::time::Instant` so tests can drive recovery with a paused clock
//! - `AtomicU64` counters for lock-free statistics

use crate::core::config::CircuitBreakerConfig;
use crate::core::types::ServiceRoute;
use crate::observability::metrics as gateway_metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state machine
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerState {
    /// Circuit is closed, normal operation
    /// Tracks the number of consecutive transient failures
    Closed { failure_count: u32 },

    /// Circuit is open, requests fail fast
    /// Records when the circuit was opened
    Open { opened_at: Instant },

    /// Circuit is half-open, testing recovery
    /// Records when the single trial request was handed out, if one is in flight
    HalfOpen { trial_started_at: Option<Instant> },
}

impl CircuitBreakerState {
    pub fn kind(&self) -> CircuitState {
        match self {
            CircuitBreakerState::Closed { .. } => CircuitState::Closed,
            CircuitBreakerState::Open { .. } => CircuitState::Open,
            CircuitBreakerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

/// Data-free view of the state, used for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a forwarded call ended, from the breaker's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// 2xx/3xx response
    Success,
    /// 4xx response: the backend is alive, the request was bad
    ClientError,
    /// Timeout, connection error or 5xx
    Failure,
}

/// Counters collected by the circuit breaker
///
/// Uses atomic operations for lock-free updates from multiple tasks
#[derive(Debug, Default)]
pub struct CircuitBreakerMetrics {
    /// Requests the breaker let through
    pub total_requests: AtomicU64,

    /// Requests rejected while open, or while a half-open trial was in flight
    pub rejected_requests: AtomicU64,

    /// Number of times the circuit has opened
    pub circuit_opened_count: AtomicU64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    last_failure_time: Option<Instant>,
}

/// Per-service circuit breaker
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
    metrics: CircuitBreakerMetrics,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for the named service
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed { failure_count: 0 },
                last_failure_time: None,
            }),
            metrics: CircuitBreakerMetrics::default(),
        }
    }

    /// Create a circuit breaker with default thresholds
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, &CircuitBreakerConfig::default())
    }

    /// Check if a request may proceed
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open here, and
    /// the caller that triggered the move holds the single trial slot.
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let allowed = match inner.state.clone() {
            CircuitBreakerState::Closed { .. } => true,
            CircuitBreakerState::Open { opened_at } => {
                if now.duration_since(opened_at) >= self.recovery_timeout {
                    self.transition(
                        &mut inner,
                        CircuitBreakerState::HalfOpen {
                            trial_started_at: Some(now),
                        },
                    );
                    true
                } else {
                    false
                }
            }
            CircuitBreakerState::HalfOpen { trial_started_at } => match trial_started_at {
                // A trial whose outcome never arrived (dropped request) is reclaimed
                // after another recovery period.
                Some(started) if now.duration_since(started) < self.recovery_timeout => false,
                _ => {
                    inner.state = CircuitBreakerState::HalfOpen {
                        trial_started_at: Some(now),
                    };
                    true
                }
            },
        };

        if allowed {
            self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.rejected_requests.fetch_add(1, Ordering::Relaxed);
            debug!(service = %self.name, "Circuit breaker rejected request");
        }

        allowed
    }

    /// Record the aggregate outcome of one forwarded request
    pub fn record_outcome(&self, outcome: CallOutcome) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match (inner.state.clone(), outcome) {
            (CircuitBreakerState::Closed { .. }, CallOutcome::Success) => {
                inner.state = CircuitBreakerState::Closed { failure_count: 0 };
            }
            (CircuitBreakerState::Closed { failure_count }, CallOutcome::Failure) => {
                inner.last_failure_time = Some(now);
                let failure_count = failure_count + 1;
                if failure_count >= self.failure_threshold {
                    self.transition(&mut inner, CircuitBreakerState::Open { opened_at: now });
                } else {
                    inner.state = CircuitBreakerState::Closed { failure_count };
                }
            }
            (CircuitBreakerState::HalfOpen { .. }, CallOutcome::Success) => {
                self.transition(&mut inner, CircuitBreakerState::Closed { failure_count: 0 });
            }
            (CircuitBreakerState::HalfOpen { .. }, CallOutcome::Failure) => {
                inner.last_failure_time = Some(now);
                self.transition(&mut inner, CircuitBreakerState::Open { opened_at: now });
            }
            (CircuitBreakerState::HalfOpen { .. }, CallOutcome::ClientError) => {
                inner.state = CircuitBreakerState::HalfOpen {
                    trial_started_at: None,
                };
            }
            (CircuitBreakerState::Open { .. }, CallOutcome::Failure) => {
                // Late result of a request admitted before the circuit opened
                inner.last_failure_time = Some(now);
            }
            (CircuitBreakerState::Closed { .. }, CallOutcome::ClientError)
            | (CircuitBreakerState::Open { .. }, _) => {}
        }
    }

    /// Give back a half-open trial slot that was admitted but never forwarded
    pub fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if let CircuitBreakerState::HalfOpen { trial_started_at: Some(_) } = inner.state {
            inner.state = CircuitBreakerState::HalfOpen {
                trial_started_at: None,
            };
        }
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitBreakerState) {
        let from = inner.state.kind();
        let to = next.kind();
        inner.state = next;

        match to {
            CircuitState::Open => {
                self.metrics
                    .circuit_opened_count
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    service = %self.name,
                    from = %from,
                    recovery_timeout = ?self.recovery_timeout,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(service = %self.name, "Circuit breaker half-open, sending trial request");
            }
            CircuitState::Closed => {
                info!(service = %self.name, from = %from, "Circuit breaker closed");
            }
        }

        gateway_metrics::record_circuit_transition(&self.name, from.as_str(), to.as_str());
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state.clone()
    }

    /// Consecutive transient failures counted while closed
    pub fn failure_count(&self) -> u32 {
        match self.inner.lock().state {
            CircuitBreakerState::Closed { failure_count } => failure_count,
            _ => 0,
        }
    }

    pub fn last_failure_time(&self) -> Option<Instant> {
        self.inner.lock().last_failure_time
    }

    /// Time left until an open circuit admits a trial request
    pub fn retry_after(&self) -> Option<Duration> {
        match self.inner.lock().state {
            CircuitBreakerState::Open { opened_at } => Some(
                self.recovery_timeout
                    .saturating_sub(Instant::now().duration_since(opened_at)),
            ),
            _ => None,
        }
    }

    /// Get the name/identifier of this circuit breaker
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &CircuitBreakerMetrics {
        &self.metrics
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let (state, failure_count) = {
            let inner = self.inner.lock();
            let failure_count = match inner.state {
                CircuitBreakerState::Closed { failure_count } => failure_count,
                _ => 0,
            };
            (inner.state.kind(), failure_count)
        };

        CircuitBreakerSnapshot {
            service: self.name.clone(),
            state,
            failure_count,
            total_requests: self.metrics.total_requests.load(Ordering::Relaxed),
            rejected_requests: self.metrics.rejected_requests.load(Ordering::Relaxed),
            circuit_opened_count: self.metrics.circuit_opened_count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one breaker, for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub circuit_opened_count: u64,
}

/// One circuit breaker per configured service
///
/// The map is built once from the route table and never changes, so lookups take no
/// lock; each breaker guards its own state.
pub struct CircuitBreakerRegistry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    enabled: bool,
}

impl CircuitBreakerRegistry {
    pub fn new(routes: &[ServiceRoute], config: &CircuitBreakerConfig) -> Self {
        let breakers = routes
            .iter()
            .map(|route| {
                (
                    route.name.clone(),
                    Arc::new(CircuitBreaker::new(route.name.clone(), config)),
                )
            })
            .collect();

        Self {
            breakers,
            enabled: config.enabled,
        }
    }

    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).cloned()
    }

    /// Whether a request to `service` may proceed; always true when disabled
    pub fn allow(&self, service: &str) -> bool {
        if !self.enabled {
            return true;
        }
        self.breakers
            .get(service)
            .map(|breaker| breaker.allow())
            .unwrap_or(true)
    }

    pub fn record_outcome(&self, service: &str, outcome: CallOutcome) {
        if !self.enabled {
            return;
        }
        if let Some(breaker) = self.breakers.get(service) {
            breaker.record_outcome(outcome);
        }
    }

    pub fn release_trial(&self, service: &str) {
        if let Some(breaker) = self.breakers.get(service) {
            breaker.release_trial();
        }
    }

    pub fn retry_after(&self, service: &str) -> Option<Duration> {
        self.breakers
            .get(service)
            .and_then(|breaker| breaker.retry_after())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RateLimitPolicy;

    fn config(failure_threshold: u32, recovery_timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold,
            recovery_timeout,
        }
    }

    fn open_breaker(cb: &CircuitBreaker, failures: u32) {
        for _ in 0..failures {
            assert!(cb.allow());
            cb.record_outcome(CallOutcome::Failure);
        }
    }

    #[tokio::test]
    async fn test_circuit_breaker_initial_state() {
        let cb = CircuitBreaker::with_defaults("users");
        assert_eq!(
            cb.state(),
            CircuitBreakerState::Closed { failure_count: 0 }
        );
        assert!(cb.allow());
        assert!(cb.retry_after().is_none());
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_failures() {
        let cb = CircuitBreaker::new("users", &config(3, Duration::from_secs(60)));

        for i in 0..2 {
            assert!(cb.allow());
            cb.record_outcome(CallOutcome::Failure);
            assert_eq!(cb.failure_count(), i + 1);
        }
        assert!(cb.allow());
        cb.record_outcome(CallOutcome::Failure);

        assert_eq!(cb.state().kind(), CircuitState::Open);
        assert!(!cb.allow());
        assert_eq!(cb.metrics().rejected_requests.load(Ordering::Relaxed), 1);
        assert_eq!(cb.metrics().circuit_opened_count.load(Ordering::Relaxed), 1);
        assert!(cb.last_failure_time().is_some());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new("users", &config(3, Duration::from_secs(60)));
        open_breaker(&cb, 2);
        assert_eq!(cb.failure_count(), 2);

        cb.record_outcome(CallOutcome::Success);
        assert_eq!(cb.failure_count(), 0);

        open_breaker(&cb, 2);
        assert_eq!(cb.state().kind(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_client_errors_do_not_touch_failure_count() {
        let cb = CircuitBreaker::new("users", &config(3, Duration::from_secs(60)));
        open_breaker(&cb, 2);

        for _ in 0..10 {
            assert!(cb.allow());
            cb.record_outcome(CallOutcome::ClientError);
        }

        assert_eq!(cb.failure_count(), 2);
        assert_eq!(cb.state().kind(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_after_timeout_closes_on_trial_success() {
        let cb = CircuitBreaker::new("bookings", &config(2, Duration::from_secs(30)));
        open_breaker(&cb, 2);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!cb.allow());
        assert_eq!(cb.retry_after(), Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.allow());
        assert_eq!(cb.state().kind(), CircuitState::HalfOpen);

        // Only one trial at a time
        assert!(!cb.allow());

        cb.record_outcome(CallOutcome::Success);
        assert_eq!(
            cb.state(),
            CircuitBreakerState::Closed { failure_count: 0 }
        );
        assert!(cb.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens() {
        let cb = CircuitBreaker::new("bookings", &config(2, Duration::from_secs(30)));
        open_breaker(&cb, 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.allow());
        cb.record_outcome(CallOutcome::Failure);

        assert_eq!(cb.state().kind(), CircuitState::Open);
        assert!(!cb.allow());
        assert_eq!(cb.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(cb.metrics().circuit_opened_count.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_in_half_open_releases_trial_slot() {
        let cb = CircuitBreaker::new("posts", &config(1, Duration::from_secs(10)));
        open_breaker(&cb, 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.allow());
        assert!(!cb.allow());

        cb.record_outcome(CallOutcome::ClientError);
        assert_eq!(cb.state().kind(), CircuitState::HalfOpen);
        assert!(cb.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_is_reclaimed() {
        let cb = CircuitBreaker::new("posts", &config(1, Duration::from_secs(10)));
        open_breaker(&cb, 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.allow());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_trial_can_be_taken_again() {
        let cb = CircuitBreaker::new("posts", &config(1, Duration::from_secs(10)));
        open_breaker(&cb, 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.allow());
        cb.release_trial();
        assert!(cb.allow());
        assert!(!cb.allow());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_are_all_counted_and_open_once() {
        let cb = Arc::new(CircuitBreaker::new("users", &config(64, Duration::from_secs(60))));

        let record_failures = |count: usize| {
            let tasks: Vec<_> = (0..count)
                .map(|_| {
                    let cb = Arc::clone(&cb);
                    tokio::spawn(async move { cb.record_outcome(CallOutcome::Failure) })
                })
                .collect();
            futures::future::join_all(tasks)
        };

        for joined in record_failures(63).await {
            joined.unwrap();
        }
        assert_eq!(cb.failure_count(), 63);
        assert_eq!(cb.state().kind(), CircuitState::Closed);

        for joined in record_failures(32).await {
            joined.unwrap();
        }
        assert_eq!(cb.state().kind(), CircuitState::Open);
        assert_eq!(cb.metrics().circuit_opened_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_registry_builds_one_breaker_per_route() {
        let routes = vec![
            ServiceRoute::new("users", "/api/v1/users", "http://u:1", RateLimitPolicy::per_minute(1)),
            ServiceRoute::new("posts", "/api/v1/posts", "http://p:1", RateLimitPolicy::per_minute(1)),
        ];
        let registry = CircuitBreakerRegistry::new(&routes, &config(1, Duration::from_secs(60)));

        assert!(registry.get("users").is_some());
        assert!(registry.get("missing").is_none());
        assert!(registry.allow("missing"));

        registry.record_outcome("users", CallOutcome::Failure);
        assert!(!registry.allow("users"));
        assert!(registry.allow("posts"));
        assert!(registry.retry_after("users").is_some());
        assert_eq!(registry.get("users").unwrap().state().kind(), CircuitState::Open);
        assert_eq!(registry.get("posts").unwrap().state().kind(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_disabled_registry_always_allows() {
        let routes = vec![ServiceRoute::new(
            "users",
            "/api/v1/users",
            "http://u:1",
            RateLimitPolicy::per_minute(1),
        )];
        let mut cfg = config(1, Duration::from_secs(60));
        cfg.enabled = false;
        let registry = CircuitBreakerRegistry::new(&routes, &cfg);

        registry.record_outcome("users", CallOutcome::Failure);
        assert!(registry.allow("users"));
        assert_eq!(
            registry.get("users").map(|b| b.state().kind()),
            Some(CircuitState::Closed)
        );
    }
}
