//! HTTP surface tests using axum-test against the full application router.

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use bytes::Bytes;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use kerya_gateway::auth::JwtClaims;
use kerya_gateway::{build_app, GatewayConfig, GatewayService, RateLimitPolicy, ServiceRoute};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const JWT_SECRET: &str = "integration-secret";

fn server_with(config: GatewayConfig) -> TestServer {
    let service = Arc::new(GatewayService::new(Arc::new(config)).unwrap());
    TestServer::new(build_app(service, None)).unwrap()
}

fn config_for(backend: &str) -> GatewayConfig {
    let mut config = GatewayConfig {
        routes: vec![ServiceRoute::new(
            "users",
            "/api/v1/users",
            backend,
            RateLimitPolicy::new(2, Duration::from_secs(60)),
        )],
        ..GatewayConfig::default()
    };
    config.retry.max_retries = 0;
    config
}

fn bearer(value: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static("authorization"),
        HeaderValue::from_str(&format!("Bearer {}", value)).unwrap(),
    )
}

#[tokio::test]
async fn test_root_banner_and_request_headers() {
    let server = server_with(config_for("http://127.0.0.1:1"));

    let response = server.get("/").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body: Value = response.json();
    assert_eq!(body["service"], "Kerya API Gateway");
    assert_eq!(body["status"], "running");

    let headers = response.headers();
    assert!(headers.contains_key("x-request-id"));
    let process_time: f64 = headers["x-process-time"].to_str().unwrap().parse().unwrap();
    assert!(process_time >= 0.0);
}

#[tokio::test]
async fn test_incoming_request_id_is_reused() {
    let server = server_with(config_for("http://127.0.0.1:1"));

    let response = server
        .get("/health")
        .add_header(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_static("req-from-client"),
        )
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "req-from-client");
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_status_lists_services() {
    let server = server_with(GatewayConfig::default());

    let response = server.get("/api/v1/status").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "API Gateway status");
    let services = body["data"]["services"].as_array().unwrap();
    assert_eq!(services.len(), 6);
    assert_eq!(services[0]["name"], "auth");
    assert_eq!(services[0]["health_status"], "unknown");
    assert_eq!(services[0]["circuit_state"], "closed");
}

#[tokio::test]
async fn test_proxy_passes_backend_response_through() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/42"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-backend", "users")
                .set_body_string("{\"id\":42}"),
        )
        .expect(1)
        .mount(&backend)
        .await;

    let server = server_with(config_for(&backend.uri()));
    let response = server.get("/api/v1/users/42").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.headers()["x-backend"], "users");
    assert_eq!(response.text(), "{\"id\":42}");
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn test_unknown_route_returns_structured_404() {
    let server = server_with(config_for("http://127.0.0.1:1"));

    let response = server.get("/api/v1/unknown/x").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);

    let request_id = response.headers()["x-request-id"].to_str().unwrap().to_string();
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert_eq!(body["error_code"], "ROUTE_NOT_FOUND");
    assert_eq!(body["request_id"], request_id);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_rate_limited_request_gets_retry_after() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&backend)
        .await;

    let server = server_with(config_for(&backend.uri()));
    for _ in 0..2 {
        assert_eq!(server.get("/api/v1/users").await.status_code(), StatusCode::OK);
    }

    let response = server.get("/api/v1/users").await;
    assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));

    let body: Value = response.json();
    assert_eq!(body["error_code"], "RATE_LIMIT_EXCEEDED");
}

#[tokio::test]
async fn test_bearer_tokens_are_validated() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&backend)
        .await;

    let mut config = config_for(&backend.uri());
    config.auth.jwt_secret = Some(JWT_SECRET.to_string());
    let server = server_with(config);

    let (name, value) = bearer("not-a-token");
    let response = server.get("/api/v1/users").add_header(name, value).await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["error_code"], "AUTHENTICATION_FAILED");

    let claims = JwtClaims {
        sub: "user-7".to_string(),
        exp: Utc::now().timestamp() + 600,
        iat: None,
        roles: Vec::new(),
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    let (name, value) = bearer(&token);
    let response = server.get("/api/v1/users").add_header(name, value).await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_route_wins_over_bad_token() {
    let mut config = config_for("http://127.0.0.1:1");
    config.auth.jwt_secret = Some(JWT_SECRET.to_string());
    let server = server_with(config);

    let (name, value) = bearer("not-a-token");
    let response = server.get("/api/v1/unknown/x").add_header(name, value).await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(body["error_code"], "ROUTE_NOT_FOUND");
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let mut config = config_for("http://127.0.0.1:1");
    config.server.request_size_limit = 16;
    let server = server_with(config);

    let response = server
        .post("/api/v1/users")
        .bytes(Bytes::from(vec![b'a'; 64]))
        .await;

    assert_eq!(response.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    let body: Value = response.json();
    assert_eq!(body["error_code"], "PAYLOAD_TOO_LARGE");
}

#[tokio::test]
async fn test_metrics_endpoint_disabled_without_recorder() {
    let server = server_with(config_for("http://127.0.0.1:1"));
    let response = server.get("/metrics").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}
