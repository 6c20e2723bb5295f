use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::Path;
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router as AxumRouter;
use hyper::{Method, StatusCode};
use serde_json::{json, Value};

use portcullis::config::{Argon2Config, GatewayConfig};
use portcullis::core::gateway::{ApiGateway, AppState};
use portcullis::models::RouteSpec;

/// Upstream fixture in the style of a tiny microservice
struct TestBackend {
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl TestBackend {
    async fn start() -> Self {
        let counter = Arc::new(AtomicU64::new(0));

        let app = AxumRouter::new()
            .route("/health", get(|| async { Json(json!({"status": "UP"})) }))
            .route(
                "/api/items",
                get({
                    let counter = counter.clone();
                    move || {
                        let counter = counter.clone();
                        async move {
                            let n = counter.fetch_add(1, Ordering::SeqCst);
                            Json(json!({"items": ["a", "b"], "generation": n}))
                        }
                    }
                }),
            )
            .route(
                "/echo",
                post(|headers: HeaderMap, body: String| async move {
                    let header_names: Vec<String> =
                        headers.keys().map(|k| k.as_str().to_string()).collect();
                    Json(json!({"body": body, "headers": header_names}))
                }),
            )
            .route(
                "/error/:code",
                get(|Path(code): Path<u16>| async move {
                    let status =
                        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    (status, Json(json!({"error": code})))
                }),
            );

        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = axum::Server::bind(&bind).serve(app.into_make_service());
        let addr = server.local_addr();
        let handle = tokio::spawn(async move {
            let _ = server.await;
        });

        Self { addr, handle }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_gateway(mutate: impl FnOnce(&mut GatewayConfig)) -> (ApiGateway, SocketAddr) {
    let mut config = GatewayConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.jwt.secret = "proxy-test-secret".to_string();
    config.admin_password = "AdminPassw0rd!".to_string();
    config.argon2 = Argon2Config {
        time_cost: 1,
        memory_cost_kib: 8,
        parallelism: 1,
    };
    mutate(&mut config);

    let state = AppState::new(config);
    state.seed_defaults().await.expect("seed defaults");

    let gateway = ApiGateway::new(state);
    let addr = gateway.start().await.expect("gateway start");
    (gateway, addr)
}

fn route_to(path: &str, method: &str, target: &str) -> RouteSpec {
    serde_json::from_value(json!({
        "path": path,
        "method": method,
        "targets": [{"url": target}],
        "public": true,
        // Probes are irrelevant here and would spam the fixture backends
        "health_check": {"enabled": false, "path": "/health", "interval_ms": 30000,
                          "timeout_ms": 5000, "healthy_threshold": 2, "unhealthy_threshold": 3},
    }))
    .expect("route spec")
}

#[tokio::test]
async fn proxies_to_backend_with_observability_headers() {
    let backend = TestBackend::start().await;
    let (gateway, addr) = start_gateway(|_| {}).await;
    gateway
        .state()
        .registry
        .put(route_to("/api/items", "GET", &backend.url()))
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/api/items", addr))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let headers = response.headers().clone();
    assert_eq!(headers.get("x-cache").unwrap(), "MISS");
    assert_eq!(
        headers.get("x-gateway-target").unwrap().to_str().unwrap(),
        backend.url()
    );
    assert_eq!(headers.get("x-gateway-route").unwrap(), "/api/items");
    assert!(headers.get("x-gateway-response-time").is_some());
    assert!(headers.get("x-trace-id").is_some());

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["items"][0], "a");

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn cached_get_serves_identical_bytes() {
    let backend = TestBackend::start().await;
    let (gateway, addr) = start_gateway(|_| {}).await;
    gateway
        .state()
        .registry
        .put(route_to("/api/items", "GET", &backend.url()))
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let url = format!("http://{}/api/items", addr);

    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.headers().get("x-cache").unwrap(), "MISS");
    let first_body = first.bytes().await.unwrap();

    let second = client.get(&url).send().await.unwrap();
    assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
    let second_body = second.bytes().await.unwrap();

    // The backend increments a generation counter per call; identical
    // bytes prove the second response never reached it.
    assert_eq!(first_body, second_body);

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn different_principals_do_not_share_cache_entries() {
    let backend = TestBackend::start().await;
    let (gateway, addr) = start_gateway(|_| {}).await;
    gateway
        .state()
        .registry
        .put(route_to("/api/items", "GET", &backend.url()))
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let url = format!("http://{}/api/items", addr);

    let alice = client
        .get(&url)
        .header("authorization", "Bearer alice-opaque")
        .send()
        .await
        .unwrap();
    let alice_body: Value = alice.json().await.unwrap();

    let bob = client
        .get(&url)
        .header("authorization", "Bearer bob-opaque")
        .send()
        .await
        .unwrap();
    assert_eq!(bob.headers().get("x-cache").unwrap(), "MISS");
    let bob_body: Value = bob.json().await.unwrap();

    // Each principal hit the backend and got its own generation
    assert_ne!(alice_body["generation"], bob_body["generation"]);

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn unmatched_path_is_404() {
    let (gateway, addr) = start_gateway(|_| {}).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{}/no/such/route", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["statusCode"], 404);
    assert!(body["traceId"].as_str().is_some());

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn no_healthy_replica_is_502() {
    let backend = TestBackend::start().await;
    let (gateway, addr) = start_gateway(|_| {}).await;
    let state = gateway.state();
    state
        .registry
        .put(route_to("/api/items", "GET", &backend.url()))
        .await
        .unwrap();
    state
        .registry
        .update_replica_health("/api/items", &Method::GET, &backend.url(), false)
        .await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/api/items", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["message"], "no healthy backend");

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn global_rate_limit_denies_with_headers() {
    let backend = TestBackend::start().await;
    let (gateway, addr) = start_gateway(|config| {
        config.rate_limit.max_requests = 3;
    })
    .await;
    gateway
        .state()
        .registry
        .put(route_to("/echo", "POST", &backend.url()))
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let url = format!("http://{}/echo", addr);

    for _ in 0..3 {
        let response = client.post(&url).body("ping").send().await.unwrap();
        assert_eq!(response.status(), 200);
    }

    let denied = client.post(&url).body("ping").send().await.unwrap();
    assert_eq!(denied.status(), 429);
    let headers = denied.headers().clone();
    assert!(headers.get("retry-after").is_some());
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
    assert!(headers.get("x-ratelimit-limit").is_some());
    assert!(headers.get("x-ratelimit-reset").is_some());

    let retry_after: u64 = headers
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after <= 60);

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn breaker_opens_after_repeated_upstream_failures() {
    let backend = TestBackend::start().await;
    let (gateway, addr) = start_gateway(|_| {}).await;

    let spec: RouteSpec = serde_json::from_value(json!({
        "path": "/error/:code",
        "method": "GET",
        "targets": [{"url": backend.url()}],
        "public": true,
        "retries": 0,
        "health_check": {"enabled": false, "path": "/health", "interval_ms": 30000,
                          "timeout_ms": 5000, "healthy_threshold": 2, "unhealthy_threshold": 3},
        "circuit_breaker": {
            "enabled": true,
            "threshold": 2,
            "window_ms": 60000,
            "timeout_ms": 30000,
            "fallback_message": "items service is resting",
        },
    }))
    .unwrap();
    gateway.state().registry.put(spec).await.unwrap();

    let client = reqwest::Client::new();
    let url = format!("http://{}/error/500", addr);

    // Two server failures trip the breaker
    for _ in 0..2 {
        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), 502);
    }

    let tripped = client.get(&url).send().await.unwrap();
    assert_eq!(tripped.status(), 503);
    assert!(tripped.headers().get("retry-after").is_some());
    let body: Value = tripped.json().await.unwrap();
    assert_eq!(body["message"], "items service is resting");
    assert!(body["retryAfter"].as_u64().is_some());

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn upstream_4xx_passes_through_without_tripping_the_breaker() {
    let backend = TestBackend::start().await;
    let (gateway, addr) = start_gateway(|_| {}).await;

    let spec: RouteSpec = serde_json::from_value(json!({
        "path": "/error/:code",
        "method": "GET",
        "targets": [{"url": backend.url()}],
        "public": true,
        "retries": 0,
        "health_check": {"enabled": false, "path": "/health", "interval_ms": 30000,
                          "timeout_ms": 5000, "healthy_threshold": 2, "unhealthy_threshold": 3},
        "circuit_breaker": {
            "enabled": true,
            "threshold": 2,
            "window_ms": 60000,
            "timeout_ms": 30000,
            "fallback_message": "unavailable",
        },
    }))
    .unwrap();
    gateway.state().registry.put(spec).await.unwrap();

    let client = reqwest::Client::new();
    let url = format!("http://{}/error/404", addr);

    for _ in 0..4 {
        let response = client.get(&url).send().await.unwrap();
        // 4xx responses are forwarded unchanged, never replaced by 503
        assert_eq!(response.status(), 404);
    }

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn non_public_route_requires_admission() {
    let backend = TestBackend::start().await;
    let (gateway, addr) = start_gateway(|_| {}).await;

    let spec: RouteSpec = serde_json::from_value(json!({
        "path": "/api/items",
        "method": "GET",
        "targets": [{"url": backend.url()}],
        "public": false,
        "health_check": {"enabled": false, "path": "/health", "interval_ms": 30000,
                          "timeout_ms": 5000, "healthy_threshold": 2, "unhealthy_threshold": 3},
    }))
    .unwrap();
    gateway.state().registry.put(spec).await.unwrap();

    let client = reqwest::Client::new();
    let base = format!("http://{}", addr);
    let url = format!("{}/api/items", base);

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 401);

    // Obtain a real token through the built-in registration endpoint
    let response = client
        .post(format!("{}/api/v1/auth/register", base))
        .json(&json!({
            "username": "proxyuser",
            "email": "proxy@example.com",
            "password": "ProxySecret7!",
            "confirmPassword": "ProxySecret7!",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    let token = body["tokens"]["accessToken"].as_str().unwrap().to_string();

    let response = client.get(&url).bearer_auth(&token).send().await.unwrap();
    assert_eq!(response.status(), 200);

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn hop_by_hop_headers_never_reach_the_upstream() {
    let backend = TestBackend::start().await;
    let (gateway, addr) = start_gateway(|_| {}).await;
    gateway
        .state()
        .registry
        .put(route_to("/echo", "POST", &backend.url()))
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/echo", addr))
        .header("te", "trailers")
        .header("x-app-header", "kept")
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    let seen: Vec<String> = body["headers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_lowercase())
        .collect();

    assert!(!seen.contains(&"te".to_string()));
    assert!(!seen.contains(&"keep-alive".to_string()));
    assert!(seen.contains(&"x-app-header".to_string()));
    assert!(seen.contains(&"x-forwarded-by".to_string()));
    assert!(seen.contains(&"x-forwarded-at".to_string()));
    assert_eq!(body["body"], "payload");

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn admin_surface_guards_and_reconfigures_routes() {
    let backend = TestBackend::start().await;
    let (gateway, addr) = start_gateway(|_| {}).await;
    let client = reqwest::Client::new();
    let base = format!("http://{}", addr);

    // Unauthenticated and non-admin callers are rejected
    let response = client
        .get(format!("{}/admin/gateway/routes", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .post(format!("{}/api/v1/auth/register", base))
        .json(&json!({
            "username": "plainuser",
            "email": "plain@example.com",
            "password": "PlainSecret9!",
            "confirmPassword": "PlainSecret9!",
        }))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    let user_token = body["tokens"]["accessToken"].as_str().unwrap().to_string();

    let response = client
        .get(format!("{}/admin/gateway/routes", base))
        .bearer_auth(&user_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // The admin can list, create and delete routes
    let response = client
        .post(format!("{}/api/v1/auth/login", base))
        .json(&json!({"username": "admin", "password": "AdminPassw0rd!"}))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    let admin_token = body["tokens"]["accessToken"].as_str().unwrap().to_string();

    let response = client
        .get(format!("{}/admin/gateway/routes", base))
        .bearer_auth(&admin_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let routes: Value = response.json().await.unwrap();
    let paths: Vec<&str> = routes
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["path"].as_str().unwrap())
        .collect();
    assert!(paths.contains(&"/api/users"));
    assert!(paths.contains(&"/api/orders"));

    let response = client
        .post(format!("{}/admin/gateway/routes", base))
        .bearer_auth(&admin_token)
        .json(&json!({
            "path": "/api/configured",
            "method": "GET",
            "targets": [{"url": backend.url()}],
            "public": true,
            "health_check": {"enabled": false, "path": "/health", "interval_ms": 30000,
                              "timeout_ms": 5000, "healthy_threshold": 2, "unhealthy_threshold": 3},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    // The freshly configured route proxies immediately... to a 404 from
    // the backend, which has no such path, proving dispatch happened.
    let response = client
        .get(format!("{}/api/configured", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    assert!(response.headers().get("x-gateway-target").is_some());

    let response = client
        .delete(format!(
            "{}/admin/gateway/routes?path=/api/configured&method=GET",
            base
        ))
        .bearer_auth(&admin_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("{}/admin/gateway/overview", base))
        .bearer_auth(&admin_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let overview: Value = response.json().await.unwrap();
    assert!(overview["routes"].as_u64().is_some());

    let response = client
        .post(format!("{}/admin/gateway/cache/clear", base))
        .bearer_auth(&admin_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let backend = TestBackend::start().await;
    let (gateway, addr) = start_gateway(|_| {}).await;
    gateway
        .state()
        .registry
        .put(route_to("/echo", "POST", &backend.url()))
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let oversized = vec![b'x'; 2 * 1024 * 1024];
    let response = client
        .post(format!("http://{}/echo", addr))
        .body(oversized)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);

    gateway.stop().await.unwrap();
}
