use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::api::{error_response, validation, TraceId};
use crate::auth::models::PublicUser;
use crate::auth::{rbac, Principal, Role, TokenVerifier};
use crate::core::gateway::AppState;
use crate::error::AuthError;
use crate::rate_limit::{endpoint_rules, RateSubject};

/// Built-in authentication endpoints under `/api/v1/auth`
pub fn routes() -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/profile", get(profile))
        .route("/admin-only", get(admin_only))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
    confirm_password: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    refresh_token: String,
}

/// Check the endpoint-specific rate rules for one of the auth endpoints.
/// Returns the denial response when over budget.
async fn check_rate_limit(
    state: &AppState,
    headers: &HeaderMap,
    remote: SocketAddr,
    method: &str,
    path: &str,
    trace_id: &str,
) -> Option<Response> {
    let rules = endpoint_rules(path);
    if rules.is_empty() {
        return None;
    }

    let subject = RateSubject::new(headers, Some(remote), method, path, None);
    let decision = state.limiter.check(&subject, &rules).await;
    if decision.allowed {
        return None;
    }

    warn!(path, ip = %subject.ip, "auth endpoint rate limited");
    let mut response = error_response(
        StatusCode::TOO_MANY_REQUESTS,
        "Rate limit exceeded",
        trace_id,
    );
    let headers = response.headers_mut();
    if let Some(retry_after) = decision.retry_after_secs {
        if let Ok(value) = retry_after.to_string().parse() {
            headers.insert("retry-after", value);
        }
    }
    if let Ok(value) = decision.limit.to_string().parse() {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = "0".parse() {
        headers.insert("x-ratelimit-remaining", value);
    }
    if let Ok(value) = (decision.reset_at_ms / 1000).to_string().parse() {
        headers.insert("x-ratelimit-reset", value);
    }
    Some(response)
}

/// Verify the bearer on a protected built-in endpoint
fn bearer_principal(state: &AppState, headers: &HeaderMap) -> Result<Principal, AuthError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(TokenVerifier::bearer_token)
        .ok_or(AuthError::InvalidOrExpired)?;
    state.verifier.verify(token)
}

async fn register(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Response {
    if let Some(denied) = check_rate_limit(
        &state,
        &headers,
        remote,
        "POST",
        "/api/v1/auth/register",
        &trace_id,
    )
    .await
    {
        return denied;
    }

    let Json(body) = match payload {
        Ok(body) => body,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Validation failed", &trace_id),
    };

    let issues = validation::validate_registration(
        &body.username,
        &body.email,
        &body.password,
        &body.confirm_password,
    );
    if !issues.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "message": "Validation failed",
                "statusCode": 400,
                "traceId": trace_id,
                "issues": issues,
            })),
        )
            .into_response();
    }

    let user = match state
        .users
        .register(&body.username, &body.email, &body.password)
        .await
    {
        Ok(user) => user,
        Err(e @ AuthError::UserExists(_)) => {
            return error_response(StatusCode::CONFLICT, &e.to_string(), &trace_id)
        }
        Err(e) => {
            warn!("registration failed: {}", e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &trace_id,
            );
        }
    };

    let tokens = match state.verifier.issue_pair(&user) {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!("token issuance failed: {}", e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &trace_id,
            );
        }
    };

    (
        StatusCode::CREATED,
        Json(json!({
            "message": "User registered successfully",
            "user": PublicUser::from(&user),
            "tokens": tokens,
        })),
    )
        .into_response()
}

async fn login(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Response {
    if let Some(denied) = check_rate_limit(
        &state,
        &headers,
        remote,
        "POST",
        "/api/v1/auth/login",
        &trace_id,
    )
    .await
    {
        return denied;
    }

    let Json(body) = match payload {
        Ok(body) => body,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Validation failed", &trace_id),
    };

    let user = match state.users.verify_login(&body.username, &body.password).await {
        Ok(user) => user,
        Err(AuthError::InvalidCredentials) => {
            warn!(username = %body.username, "login rejected");
            return error_response(StatusCode::UNAUTHORIZED, "Invalid credentials", &trace_id);
        }
        Err(e) => {
            warn!("login failed: {}", e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &trace_id,
            );
        }
    };

    let tokens = match state.verifier.issue_pair(&user) {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!("token issuance failed: {}", e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &trace_id,
            );
        }
    };

    info!(username = %user.username, "login succeeded");
    (
        StatusCode::OK,
        Json(json!({
            "message": "Login successful",
            "user": PublicUser::from(&user),
            "tokens": tokens,
        })),
    )
        .into_response()
}

async fn refresh(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Validation failed", &trace_id),
    };

    match state.verifier.refresh(&body.refresh_token, None) {
        Ok(access_token) => (
            StatusCode::OK,
            Json(json!({
                "message": "Token refreshed",
                "accessToken": access_token,
            })),
        )
            .into_response(),
        Err(_) => error_response(
            StatusCode::UNAUTHORIZED,
            "Invalid or expired token",
            &trace_id,
        ),
    }
}

async fn profile(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
) -> Response {
    match bearer_principal(&state, &headers) {
        Ok(principal) => (
            StatusCode::OK,
            Json(json!({
                "message": "Profile retrieved",
                "user": {
                    "id": principal.id,
                    "username": principal.username,
                    "email": principal.email,
                    "roles": principal.roles,
                },
            })),
        )
            .into_response(),
        Err(_) => error_response(
            StatusCode::UNAUTHORIZED,
            "Invalid or expired token",
            &trace_id,
        ),
    }
}

async fn admin_only(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    headers: HeaderMap,
) -> Response {
    let principal = match bearer_principal(&state, &headers) {
        Ok(principal) => principal,
        Err(_) => {
            return error_response(
                StatusCode::UNAUTHORIZED,
                "Invalid or expired token",
                &trace_id,
            )
        }
    };

    if let Err(denied) = rbac::authorize(
        &principal,
        &[Role::Admin],
        &[],
        rbac::PermissionLogic::Any,
    ) {
        return error_response(StatusCode::FORBIDDEN, &denied.to_string(), &trace_id);
    }

    (
        StatusCode::OK,
        Json(json!({
            "message": format!("Welcome, {}", principal.username),
        })),
    )
        .into_response()
}
