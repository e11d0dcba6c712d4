//! # Request Forwarder
//!
//! Executes one inbound request against its backend with timeouts, retries and header
//! propagation, and reports a single aggregate [`ForwardOutcome`].
//!
//! ## Timeouts
//! - `connect_timeout` is configured on the shared `reqwest` client
//! - Each attempt is bounded by `read_timeout`, further cut to whatever is left of the
//!   per-request deadline
//!
//! ## Retries
//! - Only connection errors, timeouts and 502/503/504 are retried
//! - Only GET and HEAD are retried unless `retry_non_idempotent` is set
//! - Up to `max_retries` retries follow the first attempt, the n-th waiting
//!   `retry_delay * backoff_factor^(n-1)`
//! - A retry whose delay would run past the deadline is not attempted
//!
//! The forwarder never touches the circuit breaker. The gateway service feeds the
//! aggregate outcome to the breaker exactly once per inbound request.

use crate::core::circuit_breaker::CallOutcome;
use crate::core::config::{RetryConfig, TimeoutsConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayRequest, ServiceRoute, UpstreamResponse};
use crate::observability::metrics as gateway_metrics;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client as HttpClient;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// How one attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Any status below 400
    Success(StatusCode),
    Timeout,
    ConnectionError(String),
    /// Status 400 or above
    HttpError(StatusCode),
}

impl AttemptOutcome {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptOutcome::Timeout | AttemptOutcome::ConnectionError(_) => true,
            AttemptOutcome::HttpError(status) => matches!(
                *status,
                StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
            ),
            AttemptOutcome::Success(_) => false,
        }
    }

    /// Label used for the attempt metric
    pub fn label(&self) -> String {
        match self {
            AttemptOutcome::Success(_) => "success".to_string(),
            AttemptOutcome::Timeout => "timeout".to_string(),
            AttemptOutcome::ConnectionError(_) => "connection_error".to_string(),
            AttemptOutcome::HttpError(status) => format!("http_{}", status.as_u16()),
        }
    }
}

/// Record of one outbound attempt
#[derive(Debug, Clone)]
pub struct ForwardAttempt {
    pub target_url: String,
    /// 1-based
    pub attempt_number: u32,
    pub started_at: Instant,
    pub duration: Duration,
    pub outcome: AttemptOutcome,
}

/// Final result once retries are done
#[derive(Debug, Clone)]
pub enum ForwardResult {
    /// The backend answered; any status, 5xx included
    Response(UpstreamResponse),
    /// The last attempt timed out
    Timeout { timeout: Duration },
    /// The last attempt could not reach the backend
    ConnectionFailed { message: String },
    /// The deadline had passed before a first attempt could start
    DeadlineExceeded { timeout: Duration },
}

/// Aggregate outcome of forwarding one request
#[derive(Debug, Clone)]
pub struct ForwardOutcome {
    pub result: ForwardResult,
    pub attempts: Vec<ForwardAttempt>,
}

impl ForwardOutcome {
    /// What the circuit breaker should record, `None` if no attempt was made
    pub fn call_outcome(&self) -> Option<CallOutcome> {
        if self.attempts.is_empty() {
            return None;
        }

        Some(match &self.result {
            ForwardResult::Response(response) if response.status.is_server_error() => {
                CallOutcome::Failure
            }
            ForwardResult::Response(response) if response.status.is_client_error() => {
                CallOutcome::ClientError
            }
            ForwardResult::Response(_) => CallOutcome::Success,
            ForwardResult::Timeout { .. }
            | ForwardResult::ConnectionFailed { .. }
            | ForwardResult::DeadlineExceeded { .. } => CallOutcome::Failure,
        })
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Backend response, or the error that replaces it
    pub fn into_response(self, service: &str) -> GatewayResult<UpstreamResponse> {
        match self.result {
            ForwardResult::Response(response) => Ok(response),
            ForwardResult::Timeout { timeout } => Err(GatewayError::UpstreamTimeout {
                service: service.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            ForwardResult::ConnectionFailed { message } => Err(GatewayError::UpstreamConnection {
                service: service.to_string(),
                message,
            }),
            ForwardResult::DeadlineExceeded { timeout } => Err(GatewayError::DeadlineExceeded {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Shared HTTP forwarder
#[derive(Clone)]
pub struct Forwarder {
    client: HttpClient,
    retry: RetryConfig,
    timeouts: TimeoutsConfig,
}

impl Forwarder {
    pub fn new(retry: RetryConfig, timeouts: TimeoutsConfig) -> GatewayResult<Self> {
        let client = HttpClient::builder()
            .connect_timeout(timeouts.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            retry,
            timeouts,
        })
    }

    /// Forward `request` to `route`, retrying as configured until `deadline`
    ///
    /// `upstream_path` is the inbound path with the route prefix already stripped.
    pub async fn forward(
        &self,
        request: &GatewayRequest,
        route: &ServiceRoute,
        upstream_path: &str,
        deadline: Instant,
    ) -> ForwardOutcome {
        let target_url = build_target_url(
            &route.target_base_url,
            upstream_path,
            request.query.as_deref(),
        );
        let headers = build_upstream_headers(request);
        let max_attempts = self.max_attempts(&request.method);
        let request_timeout = self.timeouts.request_timeout;

        let mut attempts: Vec<ForwardAttempt> = Vec::new();
        let mut last_result: Option<ForwardResult> = None;

        for attempt_number in 1..=max_attempts {
            let started_at = Instant::now();
            let remaining = deadline.saturating_duration_since(started_at);
            if remaining.is_zero() {
                break;
            }
            let attempt_timeout = self.timeouts.read_timeout.min(remaining);

            let (outcome, result) = self
                .attempt(&request.method, &target_url, &headers, request, attempt_timeout)
                .await;
            let duration = started_at.elapsed();

            gateway_metrics::record_upstream_attempt(&route.name, &outcome.label());
            debug!(
                service = %route.name,
                request_id = %request.request_id,
                target_url = %target_url,
                attempt = attempt_number,
                outcome = %outcome.label(),
                duration_ms = duration.as_millis() as u64,
                "Upstream attempt finished"
            );

            let retryable = outcome.is_retryable();
            attempts.push(ForwardAttempt {
                target_url: target_url.clone(),
                attempt_number,
                started_at,
                duration,
                outcome,
            });
            last_result = Some(result);

            if !retryable || attempt_number == max_attempts {
                break;
            }

            let delay = self.retry.delay_for(attempt_number);
            if deadline.saturating_duration_since(Instant::now()) <= delay {
                debug!(
                    service = %route.name,
                    request_id = %request.request_id,
                    attempt = attempt_number,
                    "Request deadline leaves no room for another retry"
                );
                break;
            }

            warn!(
                service = %route.name,
                request_id = %request.request_id,
                attempt = attempt_number,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Retrying upstream request"
            );
            tokio::time::sleep(delay).await;
        }

        ForwardOutcome {
            result: last_result.unwrap_or(ForwardResult::DeadlineExceeded {
                timeout: request_timeout,
            }),
            attempts,
        }
    }

    fn max_attempts(&self, method: &Method) -> u32 {
        let idempotent = *method == Method::GET || *method == Method::HEAD;
        if self.retry.enabled && (idempotent || self.retry.retry_non_idempotent) {
            self.retry.max_retries + 1
        } else {
            1
        }
    }

    async fn attempt(
        &self,
        method: &Method,
        target_url: &str,
        headers: &HeaderMap,
        request: &GatewayRequest,
        timeout: Duration,
    ) -> (AttemptOutcome, ForwardResult) {
        let call = async {
            let response = self
                .client
                .request(method.clone(), target_url)
                .headers(headers.clone())
                .body(request.body.clone())
                .send()
                .await?;

            let status = response.status();
            let headers = filter_response_headers(response.headers());
            let body = response.bytes().await?;

            Ok::<_, reqwest::Error>(UpstreamResponse {
                status,
                headers,
                body,
            })
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(response)) => {
                let outcome = if response.status.as_u16() < 400 {
                    AttemptOutcome::Success(response.status)
                } else {
                    AttemptOutcome::HttpError(response.status)
                };
                (outcome, ForwardResult::Response(response))
            }
            Ok(Err(e)) if e.is_timeout() && !e.is_connect() => {
                (AttemptOutcome::Timeout, ForwardResult::Timeout { timeout })
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                (
                    AttemptOutcome::ConnectionError(message.clone()),
                    ForwardResult::ConnectionFailed { message },
                )
            }
            Err(_) => (AttemptOutcome::Timeout, ForwardResult::Timeout { timeout }),
        }
    }
}

/// `base` without trailing `/` + `path` + optional `?query`
pub fn build_target_url(base: &str, path: &str, query: Option<&str>) -> String {
    let mut url = String::with_capacity(base.len() + path.len() + 16);
    url.push_str(base.trim_end_matches('/'));
    if path.is_empty() {
        url.push('/');
    } else {
        if !path.starts_with('/') {
            url.push('/');
        }
        url.push_str(path);
    }
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn is_hop_by_hop(name: &HeaderName, connection_tokens: &[String]) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
        || connection_tokens.iter().any(|token| token == name.as_str())
}

/// Header names listed in `Connection`, which are hop-by-hop for this message only
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Inbound headers minus hop-by-hop ones, `host` and `content-length`
pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let tokens = connection_tokens(headers);
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name, &tokens) || *name == header::HOST || *name == header::CONTENT_LENGTH {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Backend headers minus hop-by-hop ones and `content-length`
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let tokens = connection_tokens(headers);
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name, &tokens) || *name == header::CONTENT_LENGTH {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Filtered inbound headers plus the `x-forwarded-*` and `x-request-id` headers
fn build_upstream_headers(request: &GatewayRequest) -> HeaderMap {
    let mut headers = filter_request_headers(&request.headers);

    if let Some(ip) = request.client_ip {
        let forwarded_for = match request
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
        {
            Some(existing) => format!("{}, {}", existing, ip),
            None => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert("x-forwarded-for", value);
        }
    }

    if let Some(host) = request.headers.get(header::HOST) {
        headers.insert("x-forwarded-host", host.clone());
    }

    if let Ok(value) = HeaderValue::from_str(&request.request_id) {
        headers.insert("x-request-id", value);
    }

    headers
}
