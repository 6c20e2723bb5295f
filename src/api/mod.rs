pub mod admin;
pub mod auth;
pub mod health;
pub mod validation;

use axum::http::{HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

/// Trace id propagated through request extensions
#[derive(Debug, Clone)]
pub struct TraceId(pub String);

/// Propagate `X-Trace-Id` (or mint one) and stamp the security headers on
/// every response, error paths included.
pub async fn trace_and_secure<B>(mut request: Request<B>, next: Next<B>) -> Response {
    let trace_id = request
        .headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(TraceId(trace_id.clone()));
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        headers.insert("x-trace-id", value);
    }
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "x-xss-protection",
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );

    response
}

/// The standard JSON error envelope
pub fn error_response(status: StatusCode, message: &str, trace_id: &str) -> Response {
    (
        status,
        Json(json!({
            "message": message,
            "statusCode": status.as_u16(),
            "traceId": trace_id,
        })),
    )
        .into_response()
}
