use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use hyper::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::api::{error_response, TraceId};
use crate::auth::{rbac, Permission, Principal, TokenVerifier};
use crate::core::gateway::AppState;
use crate::models::RouteSpec;

/// Runtime reconfiguration surface under `/admin/gateway`
pub fn routes() -> Router {
    Router::new()
        .route("/routes", get(list_routes).post(put_route).delete(delete_route))
        .route("/load-balancer/stats", get(balancer_stats))
        .route("/load-balancer/reset", post(balancer_reset))
        .route("/rate-limit/stats", get(rate_limit_stats))
        .route("/rate-limit/reset", post(rate_limit_reset))
        .route("/rate-limit/*key", delete(rate_limit_delete))
        .route("/circuit-breaker/stats", get(breaker_stats))
        .route("/circuit-breaker/reset", post(breaker_reset))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/clear", post(cache_clear))
        .route("/cache/*key", delete(cache_delete))
        .route("/health/stats", get(health_stats))
        .route("/overview", get(overview))
}

/// Authenticate the bearer and require a permission. Admin holds every
/// permission through its role mapping.
fn guard(
    state: &AppState,
    headers: &HeaderMap,
    trace_id: &str,
    permission: Permission,
) -> Result<Principal, Response> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(TokenVerifier::bearer_token)
        .ok_or_else(|| {
            error_response(StatusCode::UNAUTHORIZED, "Invalid or expired token", trace_id)
        })?;

    let principal = state.verifier.verify(token).map_err(|_| {
        error_response(StatusCode::UNAUTHORIZED, "Invalid or expired token", trace_id)
    })?;

    rbac::authorize(&principal, &[], &[permission], rbac::PermissionLogic::Any)
        .map_err(|denied| error_response(StatusCode::FORBIDDEN, &denied.to_string(), trace_id))?;

    Ok(principal)
}

async fn list_routes(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = guard(&state, &headers, &trace_id, Permission::ConfigureRoutes) {
        return denied;
    }
    Json(state.registry.list().await).into_response()
}

async fn put_route(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
    payload: Result<Json<RouteSpec>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let principal = match guard(&state, &headers, &trace_id, Permission::ConfigureRoutes) {
        Ok(principal) => principal,
        Err(denied) => return denied,
    };

    let Json(spec) = match payload {
        Ok(spec) => spec,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("Invalid route definition: {}", e),
                &trace_id,
            )
        }
    };

    match state.registry.put(spec).await {
        Ok(route) => {
            info!(admin = %principal.username, path = %route.path, "route configured");
            state.monitor.watch_route(&route);
            (StatusCode::CREATED, Json(route)).into_response()
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, &e.to_string(), &trace_id),
    }
}

#[derive(Debug, Deserialize)]
struct RouteSelector {
    path: String,
    method: String,
}

async fn delete_route(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
    Query(selector): Query<RouteSelector>,
) -> Response {
    if let Err(denied) = guard(&state, &headers, &trace_id, Permission::ConfigureRoutes) {
        return denied;
    }

    let Ok(method) = Method::from_str(&selector.method) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("Invalid request: unknown method {}", selector.method),
            &trace_id,
        );
    };

    if state.registry.delete(&selector.path, &method).await {
        Json(json!({"message": "Route deleted"})).into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            &format!("No route found for {} {}", selector.method, selector.path),
            &trace_id,
        )
    }
}

async fn balancer_stats(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = guard(&state, &headers, &trace_id, Permission::ViewMetrics) {
        return denied;
    }
    Json(state.balancer.stats().await).into_response()
}

async fn balancer_reset(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = guard(&state, &headers, &trace_id, Permission::ManageRateLimits) {
        return denied;
    }
    state.balancer.reset().await;
    Json(json!({"message": "Load balancer counters reset"})).into_response()
}

async fn rate_limit_stats(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = guard(&state, &headers, &trace_id, Permission::ViewMetrics) {
        return denied;
    }
    Json(json!({
        "summary": state.limiter.stats().await,
        "windows": state.limiter.window_snapshot().await,
    }))
    .into_response()
}

async fn rate_limit_reset(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = guard(&state, &headers, &trace_id, Permission::ManageRateLimits) {
        return denied;
    }
    state.limiter.reset_all().await;
    Json(json!({"message": "Rate limit windows reset"})).into_response()
}

async fn rate_limit_delete(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    if let Err(denied) = guard(&state, &headers, &trace_id, Permission::ManageRateLimits) {
        return denied;
    }

    if state.limiter.reset_key(&key).await {
        Json(json!({"message": "Rate limit window removed"})).into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            &format!("No rate limit window for key {}", key),
            &trace_id,
        )
    }
}

async fn breaker_stats(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = guard(&state, &headers, &trace_id, Permission::ViewMetrics) {
        return denied;
    }
    Json(state.breakers.stats().await).into_response()
}

async fn breaker_reset(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = guard(&state, &headers, &trace_id, Permission::ManageRateLimits) {
        return denied;
    }
    state.breakers.reset_all().await;
    Json(json!({"message": "Circuit breakers reset"})).into_response()
}

async fn cache_stats(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = guard(&state, &headers, &trace_id, Permission::ViewMetrics) {
        return denied;
    }
    Json(state.cache.stats().await).into_response()
}

async fn cache_clear(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = guard(&state, &headers, &trace_id, Permission::ManageRateLimits) {
        return denied;
    }
    state.cache.clear().await;
    Json(json!({"message": "Cache cleared"})).into_response()
}

async fn cache_delete(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    if let Err(denied) = guard(&state, &headers, &trace_id, Permission::ManageRateLimits) {
        return denied;
    }

    if state.cache.delete(&key).await {
        Json(json!({"message": "Cache entry removed"})).into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            &format!("No cache entry for key {}", key),
            &trace_id,
        )
    }
}

async fn health_stats(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = guard(&state, &headers, &trace_id, Permission::ViewMetrics) {
        return denied;
    }
    Json(json!({
        "monitor": state.monitor.stats().await,
        "routes": state.registry.list().await,
    }))
    .into_response()
}

async fn overview(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = guard(&state, &headers, &trace_id, Permission::ViewMetrics) {
        return denied;
    }

    Json(json!({
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "routes": state.registry.len().await,
        "cache": state.cache.stats().await,
        "rateLimit": state.limiter.stats().await,
        "circuitBreakers": state.breakers.stats().await.len(),
        "loadBalancer": state.balancer.stats().await,
        "healthMonitor": state.monitor.stats().await,
    }))
    .into_response()
}
