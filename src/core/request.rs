use std::net::SocketAddr;
use std::time::SystemTime;

use bytes::Bytes;
use hyper::{HeaderMap, Method, Uri};

use crate::auth::Principal;

/// An inbound request as seen by the dispatch loop
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,

    pub uri: Uri,

    pub headers: HeaderMap,

    pub body: Bytes,

    /// Transport-level peer address
    pub remote_addr: Option<SocketAddr>,

    /// Trace id propagated from `X-Trace-Id` or freshly generated
    pub trace_id: String,

    /// Principal attached after token verification
    pub principal: Option<Principal>,

    pub received_at: SystemTime,
}

impl GatewayRequest {
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: Option<SocketAddr>,
        trace_id: String,
    ) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            remote_addr,
            trace_id,
            principal: None,
            received_at: SystemTime::now(),
        }
    }

    /// Path component of the request URI
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Query string, if any
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// A header value as a string
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The bearer token from the `Authorization` header, if present
    pub fn bearer_token(&self) -> Option<&str> {
        self.header("authorization")
            .and_then(crate::auth::TokenVerifier::bearer_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer token-123".parse().unwrap());

        let request = GatewayRequest::new(
            Method::GET,
            Uri::from_static("/api/x?page=2"),
            headers,
            Bytes::new(),
            None,
            "trace-1".to_string(),
        );

        assert_eq!(request.bearer_token(), Some("token-123"));
        assert_eq!(request.path(), "/api/x");
        assert_eq!(request.query(), Some("page=2"));
    }
}
