use bytes::Bytes;
use hyper::{HeaderMap, StatusCode};
use serde_json::json;

/// A response produced by the dispatch loop
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,

    pub headers: HeaderMap,

    pub body: Bytes,

    /// Replica that served the request, when forwarded
    pub upstream: Option<String>,

    /// Whether the body came from the response cache
    pub cache_hit: bool,

    /// Time spent in the dispatch loop, stamped by the timing middleware
    pub processing_time_ms: u64,
}

impl GatewayResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            upstream: None,
            cache_hit: false,
            processing_time_ms: 0,
        }
    }

    /// A JSON error response in the gateway's standard envelope
    pub fn error(status: StatusCode, message: &str, trace_id: &str) -> Self {
        let body = json!({
            "message": message,
            "statusCode": status.as_u16(),
            "traceId": trace_id,
        });

        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            "application/json".parse().expect("static header value"),
        );

        Self::new(
            status,
            headers,
            Bytes::from(body.to_string()),
        )
    }

    pub fn with_upstream(mut self, upstream: impl Into<String>) -> Self {
        self.upstream = Some(upstream.into());
        self
    }

    pub fn with_cache_hit(mut self, hit: bool) -> Self {
        self.cache_hit = hit;
        self
    }

    pub fn with_processing_time(mut self, ms: u64) -> Self {
        self.processing_time_ms = ms;
        self
    }

    /// Insert or replace a header, ignoring invalid values
    pub fn set_header(&mut self, name: &'static str, value: &str) {
        if let Ok(value) = value.parse() {
            self.headers
                .insert(hyper::header::HeaderName::from_static(name), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_carries_trace_id() {
        let response = GatewayResponse::error(StatusCode::NOT_FOUND, "No route found", "t-1");
        assert_eq!(response.status, StatusCode::NOT_FOUND);

        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["message"], "No route found");
        assert_eq!(body["statusCode"], 404);
        assert_eq!(body["traceId"], "t-1");
    }

    #[test]
    fn set_header_replaces_existing() {
        let mut response = GatewayResponse::new(StatusCode::OK, HeaderMap::new(), Bytes::new());
        response.set_header("x-cache", "MISS");
        response.set_header("x-cache", "HIT");
        assert_eq!(response.headers.get("x-cache").unwrap(), "HIT");
    }
}
