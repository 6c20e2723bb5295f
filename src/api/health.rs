use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::json;

/// Gateway liveness
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn ready() -> impl IntoResponse {
    Json(json!({"status": "ready"}))
}

pub async fn live() -> impl IntoResponse {
    Json(json!({"status": "live"}))
}
