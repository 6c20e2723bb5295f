use std::sync::Arc;
use std::time::Instant;

use hyper::{HeaderMap, Method, StatusCode};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::auth::{rbac, TokenVerifier};
use crate::balancer::LoadBalancer;
use crate::cache::{self, CachedResponse, ResponseCache};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::core::forwarder::{Forwarder, UpstreamResponse};
use crate::core::registry::RouteRegistry;
use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;
use crate::models::Route;
use crate::rate_limit::{endpoint_rules, RateLimitDecision, RateLimitRule, RateLimiter, RateSubject};
use crate::utils::strip_hop_by_hop;

/// Paths served by the built-in controllers, never proxied
pub const RESERVED_PATHS: [&str; 4] = ["/health", "/api/v1/auth", "/metrics", "/favicon.ico"];

/// Path prefixes whose GETs are never cached
pub const CACHE_SKIP_PATHS: [&str; 4] = ["/health", "/metrics", "/admin", "/api/v1/auth"];

/// Upper bound on any single path segment, matched parameters included
const MAX_PATH_SEGMENT_LEN: usize = 100;

/// Headers the gateway stamps itself; stripped before storing a response
const GATEWAY_HEADERS: [&str; 5] = [
    "x-cache",
    "x-trace-id",
    "x-gateway-target",
    "x-gateway-response-time",
    "x-gateway-route",
];

fn is_reserved(path: &str) -> bool {
    RESERVED_PATHS
        .iter()
        .any(|p| path == *p || path.starts_with(&format!("{}/", p)))
}

fn skips_cache(path: &str) -> bool {
    CACHE_SKIP_PATHS
        .iter()
        .any(|p| path == *p || path.starts_with(&format!("{}/", p)))
}

/// The dispatch loop: composes admission, rate limiting, caching, route
/// matching, balancing and forwarding for every proxied request.
pub struct RequestPipeline {
    registry: Arc<RouteRegistry>,
    limiter: Arc<RateLimiter>,
    cache: Arc<ResponseCache>,
    balancer: Arc<LoadBalancer>,
    forwarder: Arc<Forwarder>,
    verifier: Arc<TokenVerifier>,
    breakers: Arc<CircuitBreakerRegistry>,
    base_rules: Vec<RateLimitRule>,
}

impl RequestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<RouteRegistry>,
        limiter: Arc<RateLimiter>,
        cache: Arc<ResponseCache>,
        balancer: Arc<LoadBalancer>,
        forwarder: Arc<Forwarder>,
        verifier: Arc<TokenVerifier>,
        breakers: Arc<CircuitBreakerRegistry>,
        base_rules: Vec<RateLimitRule>,
    ) -> Self {
        Self {
            registry,
            limiter,
            cache,
            balancer,
            forwarder,
            verifier,
            breakers,
            base_rules,
        }
    }

    /// Dispatch one request. Never fails: every error becomes a response
    /// in the standard envelope.
    pub async fn dispatch(&self, mut request: GatewayRequest) -> GatewayResponse {
        let started = Instant::now();
        let trace_id = request.trace_id.clone();
        let path = request.path().to_string();
        let method = request.method.clone();

        // Reserved paths are handled by the built-in controllers; a request
        // landing here for one of them has no matching handler.
        if is_reserved(&path) {
            return GatewayResponse::error(
                StatusCode::NOT_FOUND,
                &format!("No route found for {} {}", method, path),
                &trace_id,
            );
        }

        if path.split('/').any(|s| s.len() > MAX_PATH_SEGMENT_LEN) {
            return GatewayResponse::error(
                StatusCode::BAD_REQUEST,
                "Invalid request: path segment too long",
                &trace_id,
            );
        }

        // Best-effort identity for user-scoped rate limiting; strict
        // admission happens after route matching.
        if let Some(token) = request.bearer_token() {
            if let Ok(principal) = self.verifier.verify(token) {
                request.principal = Some(principal);
            }
        }

        let subject = RateSubject::new(
            &request.headers,
            request.remote_addr,
            method.as_str(),
            &path,
            request.principal.as_ref(),
        );
        let mut rules = self.base_rules.clone();
        rules.extend(endpoint_rules(&path));
        let decision = self.limiter.check(&subject, &rules).await;

        if !decision.allowed {
            info!(%method, %path, ip = %subject.ip, "request rate limited");
            let mut response = GatewayResponse::error(
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded",
                &trace_id,
            );
            apply_rate_limit_headers(&mut response, &decision);
            if let Some(retry_after) = decision.retry_after_secs {
                response.set_header("retry-after", &retry_after.to_string());
            }
            return response;
        }

        let Some(route) = self.registry.find_match(&path, &method).await else {
            debug!(%method, %path, "no matching route");
            return GatewayResponse::error(
                StatusCode::NOT_FOUND,
                &format!("No route found for {} {}", method, path),
                &trace_id,
            );
        };

        // Admission: non-public routes require a verified principal that
        // passes the route's role/permission predicates.
        if !route.public {
            let Some(principal) = request.principal.as_ref() else {
                return GatewayResponse::error(
                    StatusCode::UNAUTHORIZED,
                    "Invalid or expired token",
                    &trace_id,
                );
            };

            if let Err(denied) = rbac::authorize(
                principal,
                &route.required_roles,
                &route.required_permissions,
                rbac::PermissionLogic::Any,
            ) {
                warn!(user = %principal.username, %path, "authorization failed");
                return GatewayResponse::error(
                    StatusCode::FORBIDDEN,
                    &denied.to_string(),
                    &trace_id,
                );
            }
        }

        // Cache lookup for GETs outside the skip list. Keys carry a user
        // discriminator when the request is authenticated.
        let cache_key = (method == Method::GET && !skips_cache(&path))
            .then(|| cache::http_key(method.as_str(), &request.uri.to_string(), Some(&request.headers)));

        if let Some(key) = &cache_key {
            if let Some(cached) = self.cache.get(key).await {
                debug!(%method, %path, "served from cache");
                let mut response = cached_to_response(cached);
                response.set_header("x-cache", "HIT");
                response.set_header("x-gateway-route", &route.path);
                response.set_header(
                    "x-gateway-response-time",
                    &started.elapsed().as_millis().to_string(),
                );
                apply_rate_limit_headers(&mut response, &decision);
                return response.with_cache_hit(true);
            }
        }

        let replicas = self
            .registry
            .healthy_replicas(&route.path, &route.method)
            .await;
        if replicas.is_empty() {
            warn!(%method, %path, "no healthy backend");
            return GatewayResponse::error(
                StatusCode::BAD_GATEWAY,
                "no healthy backend",
                &trace_id,
            );
        }

        let route_key = format!("{} {}", route.method, route.path);
        let Some(replica) = self
            .balancer
            .select(&route_key, route.balancer, &replicas, None)
            .await
        else {
            return GatewayResponse::error(
                StatusCode::BAD_GATEWAY,
                "no healthy backend",
                &trace_id,
            );
        };

        let breaker = route
            .circuit_breaker
            .enabled
            .then_some((route.id.as_str(), &route.circuit_breaker));

        self.balancer.incr_in_flight(&replica.url).await;
        let outcome = self
            .forwarder
            .forward(&request, &replica, route.timeout(), route.retries, breaker)
            .await;
        self.balancer.decr_in_flight(&replica.url).await;

        match outcome {
            Ok(upstream) => {
                self.registry
                    .update_replica_latency(&route.path, &route.method, &replica.url, upstream.latency_ms)
                    .await;
                self.registry
                    .note_replica_success(&route.path, &route.method, &replica.url)
                    .await;

                let elapsed_ms = started.elapsed().as_millis() as u64;
                let mut response = upstream_to_response(&upstream);
                response.set_header("x-gateway-target", &replica.url);
                response.set_header("x-gateway-route", &route.path);
                response.set_header("x-gateway-response-time", &elapsed_ms.to_string());
                response.set_header("x-cache", "MISS");
                apply_rate_limit_headers(&mut response, &decision);

                if let Some(key) = &cache_key {
                    if cache::should_cache_response(upstream.status.as_u16(), &upstream.headers) {
                        let ttl = cache::ttl_from_headers(&upstream.headers);
                        self.cache
                            .set(key, storable_response(&upstream), ttl)
                            .await;
                    }
                }

                response.with_upstream(replica.url.clone())
            }
            Err(error) => {
                self.registry
                    .record_replica_error(&route.path, &route.method, &replica.url)
                    .await;
                self.error_to_response(error, &route, &trace_id, &decision)
            }
        }
    }

    fn error_to_response(
        &self,
        error: GatewayError,
        route: &Route,
        trace_id: &str,
        decision: &RateLimitDecision,
    ) -> GatewayResponse {
        let mut response = match &error {
            GatewayError::ServiceUnavailable { retry_after_secs } => {
                let body = json!({
                    "message": route.circuit_breaker.fallback_message,
                    "statusCode": 503,
                    "traceId": trace_id,
                    "retryAfter": retry_after_secs,
                });
                let mut headers = HeaderMap::new();
                headers.insert(
                    hyper::header::CONTENT_TYPE,
                    "application/json".parse().expect("static header value"),
                );
                let mut response = GatewayResponse::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    headers,
                    bytes::Bytes::from(body.to_string()),
                );
                response.set_header("retry-after", &retry_after_secs.to_string());
                response
            }
            GatewayError::GatewayTimeout => GatewayResponse::error(
                StatusCode::GATEWAY_TIMEOUT,
                "Upstream request timed out",
                trace_id,
            ),
            GatewayError::BadGateway(_) => {
                // Upstream details stay out of the client-facing body
                GatewayResponse::error(StatusCode::BAD_GATEWAY, "Bad gateway", trace_id)
            }
            other => {
                warn!(kind = other.kind(), "unexpected pipeline error: {}", other);
                GatewayResponse::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                    trace_id,
                )
            }
        };

        apply_rate_limit_headers(&mut response, decision);
        response
    }

    /// Circuit breaker registry handle, exposed for the admin surface
    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        self.breakers.clone()
    }
}

fn apply_rate_limit_headers(response: &mut GatewayResponse, decision: &RateLimitDecision) {
    if decision.limit == u64::MAX {
        return;
    }
    response.set_header("x-ratelimit-limit", &decision.limit.to_string());
    response.set_header("x-ratelimit-remaining", &decision.remaining.to_string());
    response.set_header("x-ratelimit-reset", &(decision.reset_at_ms / 1000).to_string());
}

/// Build the client response from an upstream response, hop-by-hop headers
/// removed.
fn upstream_to_response(upstream: &UpstreamResponse) -> GatewayResponse {
    let mut headers = upstream.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(hyper::header::CONTENT_LENGTH);

    GatewayResponse::new(upstream.status, headers, upstream.body.clone())
}

/// The subset of an upstream response worth caching: scrubbed headers plus
/// the original body bytes.
fn storable_response(upstream: &UpstreamResponse) -> CachedResponse {
    let mut headers = upstream.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(hyper::header::CONTENT_LENGTH);
    for name in GATEWAY_HEADERS {
        headers.remove(name);
    }

    CachedResponse {
        status: upstream.status.as_u16(),
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
        body: upstream.body.clone(),
    }
}

fn cached_to_response(cached: CachedResponse) -> GatewayResponse {
    let mut headers = HeaderMap::new();
    for (name, value) in &cached.headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<hyper::header::HeaderName>(),
            value.parse::<hyper::header::HeaderValue>(),
        ) {
            headers.append(name, value);
        }
    }

    GatewayResponse::new(
        StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK),
        headers,
        cached.body,
    )
}
