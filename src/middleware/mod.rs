pub mod logging;
pub mod timing;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;

/// Cross-cutting middleware wrapping the dispatch loop
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process a request, delegating to the next handler in the chain
    async fn process_request(
        &self,
        request: GatewayRequest,
        next: Arc<dyn MiddlewareHandler>,
    ) -> Result<GatewayResponse, GatewayError>;

    fn name(&self) -> &str;
}

/// The next stage of the chain
#[async_trait]
pub trait MiddlewareHandler: Send + Sync {
    async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError>;
}

/// Ordered middleware chain built around a final handler
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    pub fn add<M: Middleware + 'static>(&mut self, middleware: M) {
        tracing::debug!("registered middleware: {}", middleware.name());
        self.middlewares.push(Arc::new(middleware));
    }

    /// Wrap the final handler so that the first-added middleware runs first
    pub fn build(self, final_handler: Arc<dyn MiddlewareHandler>) -> Arc<dyn MiddlewareHandler> {
        let mut handler = final_handler;
        for middleware in self.middlewares.into_iter().rev() {
            handler = Arc::new(Link {
                middleware,
                next: handler,
            });
        }
        handler
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

struct Link {
    middleware: Arc<dyn Middleware>,
    next: Arc<dyn MiddlewareHandler>,
}

#[async_trait]
impl MiddlewareHandler for Link {
    async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        self.middleware
            .process_request(request, self.next.clone())
            .await
    }
}

/// Adapts a closure into the innermost handler of a chain
pub struct FinalHandler<F>
where
    F: Fn(GatewayRequest) -> BoxFuture<'static, Result<GatewayResponse, GatewayError>>
        + Send
        + Sync,
{
    handler: F,
}

impl<F> FinalHandler<F>
where
    F: Fn(GatewayRequest) -> BoxFuture<'static, Result<GatewayResponse, GatewayError>>
        + Send
        + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F> MiddlewareHandler for FinalHandler<F>
where
    F: Fn(GatewayRequest) -> BoxFuture<'static, Result<GatewayResponse, GatewayError>>
        + Send
        + Sync,
{
    async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        (self.handler)(request).await
    }
}
