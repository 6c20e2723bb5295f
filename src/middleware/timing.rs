use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;
use crate::middleware::{Middleware, MiddlewareHandler};

/// Measures dispatch time and flags slow requests
pub struct TimingMiddleware {
    slow_threshold_ms: u64,
}

impl TimingMiddleware {
    pub fn new(slow_threshold_ms: u64) -> Self {
        Self { slow_threshold_ms }
    }
}

impl Default for TimingMiddleware {
    fn default() -> Self {
        Self::new(500)
    }
}

#[async_trait]
impl Middleware for TimingMiddleware {
    async fn process_request(
        &self,
        request: GatewayRequest,
        next: Arc<dyn MiddlewareHandler>,
    ) -> Result<GatewayResponse, GatewayError> {
        let method = request.method.clone();
        let path = request.path().to_string();
        let started = Instant::now();

        let result = next.handle(request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if elapsed_ms > self.slow_threshold_ms {
            tracing::warn!(
                %method,
                %path,
                elapsed_ms,
                threshold_ms = self.slow_threshold_ms,
                "slow request"
            );
        }

        result.map(|response| response.with_processing_time(elapsed_ms))
    }

    fn name(&self) -> &str {
        "timing"
    }
}
