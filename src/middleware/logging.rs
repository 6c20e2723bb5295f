use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;
use crate::middleware::{Middleware, MiddlewareHandler};

/// Initialize structured JSON logging. `RUST_LOG` overrides the given
/// default level.
pub fn init_tracing(default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).json();

    Registry::default().with(env_filter).with(fmt_layer).init();
}

/// How much of each request gets logged
#[derive(Debug, Clone, Copy)]
pub enum LogDetail {
    /// Method, path, status, duration
    Basic,
    /// Basic plus client ip and user agent
    Detailed,
}

/// Request/response logging around the dispatch loop
pub struct LoggingMiddleware {
    detail: LogDetail,
}

impl LoggingMiddleware {
    pub fn new(detail: LogDetail) -> Self {
        Self { detail }
    }

    pub fn basic() -> Self {
        Self::new(LogDetail::Basic)
    }

    pub fn detailed() -> Self {
        Self::new(LogDetail::Detailed)
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn process_request(
        &self,
        request: GatewayRequest,
        next: Arc<dyn MiddlewareHandler>,
    ) -> Result<GatewayResponse, GatewayError> {
        let span = tracing::info_span!(
            "request",
            trace_id = %request.trace_id,
            method = %request.method,
            path = %request.path(),
        );

        if matches!(self.detail, LogDetail::Detailed) {
            tracing::debug!(
                parent: &span,
                query = ?request.query(),
                remote = ?request.remote_addr,
                user_agent = ?request.header("user-agent"),
                "request received"
            );
        }

        let started = Instant::now();
        let result = next.handle(request).instrument(span.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => {
                tracing::info!(
                    parent: &span,
                    status = response.status.as_u16(),
                    elapsed_ms,
                    cache_hit = response.cache_hit,
                    upstream = ?response.upstream,
                    "request completed"
                );
            }
            Err(error) => {
                tracing::warn!(
                    parent: &span,
                    kind = error.kind(),
                    elapsed_ms,
                    "request failed: {}",
                    error
                );
            }
        }

        result
    }

    fn name(&self) -> &str {
        "logging"
    }
}
