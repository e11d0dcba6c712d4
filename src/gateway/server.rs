//! # HTTP Server Module
//!
//! Axum front end for the gateway service.
//!
//! ## Endpoints
//! - `GET /`: service banner
//! - `GET /health`: gateway self health
//! - `GET /metrics`: Prometheus exposition, when a recorder handle is supplied
//! - `GET {api_prefix}/status`: per-service health and circuit state
//! - anything else: proxied through [`GatewayService::handle`]
//!
//! Every response carries `x-request-id` (reused from the request, else a new UUID) and
//! `x-process-time` in seconds.

use crate::core::error::{retry_after_secs, GatewayError, GatewayResult};
use crate::core::types::{GatewayRequest, Identity, UpstreamResponse};
use crate::gateway::service::GatewayService;
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router as AxumRouter,
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

const X_REQUEST_ID: &str = "x-request-id";
const X_PROCESS_TIME: &str = "x-process-time";

const SERVICE_NAME: &str = "Kerya API Gateway";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<GatewayService>,
    pub metrics: Option<PrometheusHandle>,
}

/// Request id attached to every request by [`request_context`]
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Build the axum application
pub fn build_app(service: Arc<GatewayService>, metrics: Option<PrometheusHandle>) -> AxumRouter {
    let server = &service.config().server;
    let api_prefix = server.api_prefix.trim_end_matches('/').to_string();
    let cors = cors_layer(&server.cors_origins);

    let state = AppState { service, metrics };

    AxumRouter::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(&format!("{}/status", api_prefix), get(status_handler))
        .fallback(proxy_handler)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(middleware::from_fn(request_context)),
        )
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves
pub async fn serve<F>(app: AxumRouter, bind_address: &str, shutdown: F) -> GatewayResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind_address).await.map_err(|e| {
        GatewayError::internal(format!("Failed to bind to {}: {}", bind_address, e))
    })?;
    info!(address = %bind_address, "Gateway HTTP server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| GatewayError::internal(format!("Server error: {}", e)))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(X_REQUEST_ID),
            HeaderName::from_static(X_PROCESS_TIME),
        ]);

    if origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    layer.allow_origin(AllowOrigin::list(allowed))
}

/// Assign the request id and stamp the response headers
async fn request_context(mut request: Request, next: Next) -> Response {
    let started = Instant::now();
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    let elapsed = format!("{:.6}", started.elapsed().as_secs_f64());
    if let Ok(value) = HeaderValue::from_str(&elapsed) {
        headers.insert(X_PROCESS_TIME, value);
    }

    response
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "api-gateway",
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics are disabled").into_response(),
    }
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "success": true,
        "message": "API Gateway status",
        "data": {
            "services": state.service.services_status(),
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn proxy_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    request: Request,
) -> Response {
    let client_ip = connect_info.map(|ConnectInfo(addr)| addr.ip());

    match build_gateway_request(&state, request, client_ip, &request_id).await {
        Ok(gateway_request) => match state.service.handle(gateway_request).await {
            Ok(upstream) => upstream_response(upstream),
            Err(e) => error_response(&e, &request_id),
        },
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "Rejected inbound request");
            error_response(&e, &request_id)
        }
    }
}

async fn build_gateway_request(
    state: &AppState,
    request: Request,
    client_ip: Option<std::net::IpAddr>,
    request_id: &str,
) -> GatewayResult<GatewayRequest> {
    let limit = state.service.config().server.request_size_limit;
    let (parts, body) = request.into_parts();

    if state.service.router().resolve(parts.uri.path()).is_none() {
        return Err(GatewayError::route_not_found(parts.uri.path()));
    }

    let declared_length = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared_length.is_some_and(|length| length > limit) {
        return Err(GatewayError::PayloadTooLarge { limit });
    }

    let user_id = state.service.authenticate(&parts.headers)?;

    let body = read_body(body, limit).await?;

    let mut gateway_request = GatewayRequest::new(parts.method, parts.uri.path())
        .with_body(body)
        .with_identity(Identity::resolve(user_id, client_ip))
        .with_request_id(request_id);
    if let Some(query) = parts.uri.query() {
        gateway_request = gateway_request.with_query(query);
    }
    if let Some(ip) = client_ip {
        gateway_request = gateway_request.with_client_ip(ip);
    }
    gateway_request.headers = parts.headers;

    Ok(gateway_request)
}

/// Buffer the body, enforcing `limit` on chunked bodies as they stream in
async fn read_body(body: Body, limit: usize) -> GatewayResult<Bytes> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(GatewayError::PayloadTooLarge { limit }),
        Err(e) => Err(GatewayError::BadRequest {
            message: format!("Failed to read request body: {}", e),
        }),
    }
}

fn upstream_response(upstream: UpstreamResponse) -> Response {
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    response
}

fn error_response(error: &GatewayError, request_id: &str) -> Response {
    let mut response = (error.status_code(), Json(error.to_body(request_id))).into_response();

    if let Some(retry_after) = error.retry_after() {
        if let Ok(value) = HeaderValue::from_str(&retry_after_secs(retry_after).to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }

    response
}
