use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use hyper::{HeaderMap, Method, StatusCode};
use rand::Rng;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::ForwarderConfig;
use crate::core::request::GatewayRequest;
use crate::error::GatewayError;
use crate::models::{CircuitBreakerPolicy, Replica};
use crate::utils::strip_hop_by_hop;

const DEFAULT_USER_AGENT: &str = concat!("portcullis/", env!("CARGO_PKG_VERSION"));

/// What came back from the upstream
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub latency_ms: u64,
}

/// Performs the upstream HTTP call with timeout, retry with exponential
/// backoff and jitter, and circuit-breaker accounting.
pub struct Forwarder {
    client: reqwest::Client,
    breakers: Arc<CircuitBreakerRegistry>,
    gateway_id: String,
}

impl Forwarder {
    pub fn new(
        config: &ForwarderConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        gateway_id: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("failed to build upstream client with custom settings: {}", e);
                reqwest::Client::new()
            });

        Self {
            client,
            breakers,
            gateway_id: gateway_id.into(),
        }
    }

    /// Forward a request to a replica.
    ///
    /// Returns `Ok` for any non-5xx upstream response. Server-class
    /// failures (5xx, connect errors, timeouts) are retried up to
    /// `retries` additional attempts and feed the circuit breaker; 4xx
    /// responses are returned unchanged and never counted.
    pub async fn forward(
        &self,
        request: &GatewayRequest,
        replica: &Replica,
        timeout: Duration,
        retries: u32,
        breaker: Option<(&str, &CircuitBreakerPolicy)>,
    ) -> Result<UpstreamResponse, GatewayError> {
        if let Some((route_id, policy)) = breaker {
            if !self
                .breakers
                .can_execute(route_id, &replica.url, policy)
                .await
            {
                let retry_after = self.breakers.retry_after_secs(route_id, &replica.url).await;
                return Err(GatewayError::ServiceUnavailable {
                    retry_after_secs: retry_after,
                });
            }
        }

        let url = upstream_url(&replica.url, request.path(), request.query())?;
        let headers = self.prepare_headers(&request.headers);
        let attempts = retries + 1;
        let mut last_error = GatewayError::BadGateway("upstream unreachable".to_string());

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = jittered_backoff(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying upstream call");
                tokio::time::sleep(delay).await;
            }

            let started = Instant::now();
            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .headers(headers.clone())
                .timeout(timeout);

            if request.method != Method::GET && request.method != Method::HEAD {
                builder = builder.body(request.body.clone());
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    let response_headers = response.headers().clone();
                    let latency_ms = started.elapsed().as_millis() as u64;

                    if status.is_server_error() {
                        warn!(%url, %status, attempt, "upstream returned server error");
                        self.record_failure(breaker, &replica.url).await;
                        last_error = GatewayError::BadGateway(format!(
                            "upstream responded {}",
                            status.as_u16()
                        ));
                        continue;
                    }

                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| GatewayError::BadGateway(e.to_string()))?;

                    if let Some(content_type) = response_headers
                        .get("content-type")
                        .and_then(|v| v.to_str().ok())
                    {
                        if content_type.contains("application/json")
                            && serde_json::from_slice::<serde_json::Value>(&body).is_err()
                        {
                            debug!(%url, "upstream body is not valid JSON despite content type");
                        }
                    }

                    self.record_success(breaker, &replica.url).await;
                    return Ok(UpstreamResponse {
                        status,
                        headers: response_headers,
                        body,
                        latency_ms,
                    });
                }
                Err(e) if e.is_timeout() => {
                    warn!(%url, attempt, "upstream call timed out");
                    self.record_failure(breaker, &replica.url).await;
                    last_error = GatewayError::GatewayTimeout;
                }
                Err(e) => {
                    warn!(%url, attempt, error = %e, "upstream call failed");
                    self.record_failure(breaker, &replica.url).await;
                    last_error = GatewayError::BadGateway(e.to_string());
                }
            }
        }

        Err(last_error)
    }

    /// Copy the inbound headers minus hop-by-hop ones and stamp the
    /// forwarding metadata.
    fn prepare_headers(&self, inbound: &HeaderMap) -> HeaderMap {
        let mut headers = inbound.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove("host");

        if let Ok(value) = self.gateway_id.parse() {
            headers.insert("x-forwarded-by", value);
        }
        if let Ok(value) = Utc::now().to_rfc3339().parse() {
            headers.insert("x-forwarded-at", value);
        }
        if !headers.contains_key("user-agent") {
            headers.insert(
                "user-agent",
                DEFAULT_USER_AGENT.parse().expect("static header value"),
            );
        }

        headers
    }

    async fn record_success(
        &self,
        breaker: Option<(&str, &CircuitBreakerPolicy)>,
        replica_url: &str,
    ) {
        if let Some((route_id, policy)) = breaker {
            self.breakers
                .record_success(route_id, replica_url, policy)
                .await;
        }
    }

    async fn record_failure(
        &self,
        breaker: Option<(&str, &CircuitBreakerPolicy)>,
        replica_url: &str,
    ) {
        if let Some((route_id, policy)) = breaker {
            self.breakers
                .record_failure(route_id, replica_url, policy)
                .await;
        }
    }
}

/// Resolve the request path against the replica base URL, carrying the
/// query string over.
pub fn upstream_url(base: &str, path: &str, query: Option<&str>) -> Result<String, GatewayError> {
    let base = url::Url::parse(base)
        .map_err(|e| GatewayError::BadGateway(format!("invalid replica url '{}': {}", base, e)))?;

    let mut url = base.clone();
    let joined = format!("{}{}", base.path().trim_end_matches('/'), path);
    url.set_path(&joined);
    url.set_query(query);
    Ok(url.to_string())
}

/// Exponential backoff base: `min(10 s, 1 s · 2^(retry-1))`
fn backoff_base(retry: u32) -> Duration {
    let exp = retry.saturating_sub(1).min(10);
    Duration::from_secs(1u64 << exp).min(Duration::from_secs(10))
}

/// Backoff with ±25% uniform jitter, floored at 100 ms
fn jittered_backoff(retry: u32) -> Duration {
    let base = backoff_base(retry).as_millis() as f64;
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    let delay = (base * factor) as u64;
    Duration::from_millis(delay.max(100))
}
