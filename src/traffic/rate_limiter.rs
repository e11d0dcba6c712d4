//! # Fixed-Window Rate Limiter
//!
//! Counters live in a `DashMap` keyed by scope, so callers on different keys never
//! contend on a single lock. The check and the increment for one key happen under that
//! key's shard lock, which makes `check_and_increment` atomic per key.
//!
//! ## Window Semantics
//! - A window is created lazily on the first request for a key
//! - Once `window` has elapsed since `window_start`, the next request starts a new window
//! - A rejected request does not increment the counter, so `count <= limit` always holds
//! - A request rejected in a later scope gives back the slots it took in earlier ones
//! - Expired windows are dropped by a periodic sweep (`rate_limit.cleanup_interval`)

use crate::core::config::RateLimitConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Identity, RateLimitPolicy, ServiceRoute};
use crate::observability::metrics as gateway_metrics;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one `check_and_increment` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed {
        /// Requests still available in the current window
        remaining: u32,
        /// Time until the current window ends
        reset_after: Duration,
    },
    Rejected {
        /// Time until a new window opens
        retry_after: Duration,
    },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

#[derive(Debug, Clone)]
struct RateLimitWindow {
    count: u32,
    window_start: Instant,
    limit: u32,
    window: Duration,
}

impl RateLimitWindow {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.window_start) >= self.window
    }
}

/// Key for the shared global window
pub fn global_key() -> String {
    "global".to_string()
}

/// Key for a caller's identity window
pub fn identity_key(identity: &Identity) -> String {
    format!("identity:{}", identity)
}

/// Key for a caller's window on one route
pub fn route_key(route_name: &str, identity: &Identity) -> String {
    format!("route:{}:{}", route_name, identity)
}

struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Rate limiter shared by every request task
pub struct RateLimiter {
    windows: DashMap<String, RateLimitWindow>,
    config: RateLimitConfig,
    sweeper: Mutex<Option<Sweeper>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config,
            sweeper: Mutex::new(None),
        }
    }

    /// Count one request against `key`, unless its window is already full
    pub fn check_and_increment(&self, key: &str, policy: &RateLimitPolicy) -> RateLimitDecision {
        self.acquire(key, policy).0
    }

    /// Same as `check_and_increment`, also returning the start of the window counted into
    fn acquire(&self, key: &str, policy: &RateLimitPolicy) -> (RateLimitDecision, Instant) {
        let now = Instant::now();

        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| RateLimitWindow {
                count: 0,
                window_start: now,
                limit: policy.requests,
                window: policy.window,
            });
        let window = entry.value_mut();

        window.limit = policy.requests;
        window.window = policy.window;

        if window.is_expired(now) {
            window.window_start = now;
            window.count = 0;
        }

        let reset_after = window
            .window
            .saturating_sub(now.duration_since(window.window_start));

        if window.count >= window.limit {
            let decision = RateLimitDecision::Rejected {
                retry_after: reset_after,
            };
            return (decision, window.window_start);
        }

        window.count += 1;
        let decision = RateLimitDecision::Allowed {
            remaining: window.limit - window.count,
            reset_after,
        };
        (decision, window.window_start)
    }

    /// Give back one slot taken by `acquire`, if that window is still current
    fn release(&self, key: &str, window_start: Instant) {
        if let Some(mut window) = self.windows.get_mut(key) {
            if window.window_start == window_start {
                window.count = window.count.saturating_sub(1);
            }
        }
    }

    /// Apply global, identity and route limits in that order
    ///
    /// The first scope that rejects ends the check. Slots already taken in earlier
    /// scopes are given back, so a rejected request is not counted anywhere.
    pub fn check_request(&self, identity: &Identity, route: &ServiceRoute) -> GatewayResult<()> {
        let scopes = [
            ("global", global_key(), self.config.global),
            ("identity", identity_key(identity), self.config.per_user),
            ("route", route_key(&route.name, identity), route.rate_limit),
        ];

        let mut taken: Vec<(&str, Instant)> = Vec::with_capacity(scopes.len());
        for (scope, key, policy) in &scopes {
            match self.acquire(key, policy) {
                (RateLimitDecision::Allowed { .. }, window_start) => {
                    taken.push((key.as_str(), window_start));
                }
                (RateLimitDecision::Rejected { retry_after }, _) => {
                    for (taken_key, window_start) in taken {
                        self.release(taken_key, window_start);
                    }

                    gateway_metrics::record_rate_limit_rejection(scope, &route.name);
                    debug!(
                        scope = *scope,
                        key = %key,
                        service = %route.name,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Rate limit exceeded"
                    );
                    return Err(GatewayError::RateLimitExceeded {
                        scope: scope.to_string(),
                        limit: policy.requests,
                        window: policy.window,
                        retry_after,
                    });
                }
            }
        }

        Ok(())
    }

    /// Drop every window whose period has ended; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now));
        before.saturating_sub(self.windows.len())
    }

    /// Number of live windows
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Current count for `key`, if a window exists
    pub fn current_count(&self, key: &str) -> Option<u32> {
        self.windows.get(key).map(|window| window.count)
    }

    /// Start the background sweep of expired windows
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            warn!("Rate limit sweeper already running");
            return;
        }

        let cancel = CancellationToken::new();
        let limiter = Arc::clone(self);
        let token = cancel.clone();
        let period = self.config.cleanup_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.purge_expired();
                        if removed > 0 {
                            debug!(removed = removed, remaining = limiter.window_count(), "Swept expired rate limit windows");
                        }
                    }
                }
            }
        });

        info!(interval = ?period, "Rate limit sweeper started");
        *sweeper = Some(Sweeper { cancel, handle });
    }

    /// Stop the sweeper and wait for it to exit
    pub async fn stop(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.cancel.cancel();
            if let Err(e) = sweeper.handle.await {
                warn!(error = %e, "Rate limit sweeper did not shut down cleanly");
            }
            info!("Rate limit sweeper stopped");
        }
    }
}
